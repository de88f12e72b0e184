use std::fs::File;
use std::io::{self, Cursor, Read, Write};
use std::process;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use gridftp_client::cli::{parse_args, CliArgs, Verb};
use gridftp_client::config::{EngineConfig, EnvParams};
use gridftp_client::data::{shared_sink, shared_source, SharedSink};
use gridftp_client::features::{Feature, Tristate};
use gridftp_client::logging::{self, Level};
use gridftp_client::plugins::{DebugPlugin, RestartPlugin};
use gridftp_client::shutdown;
use gridftp_client::{ClientError, Completion, Handle};

type Outcome = Result<Completion, ClientError>;

/// Where retrieved bytes end up once the operation is over.
enum Output {
    File,
    Stdout(Arc<Mutex<Cursor<Vec<u8>>>>),
    None,
}

fn fail(message: &str) -> ! {
    let _ = logging::log(&format!("Error: {}", message));
    eprintln!("Error: {}", message);
    process::exit(1);
}

fn load_config(args: &CliArgs) -> EngineConfig {
    let mut config = match &args.config_file {
        Some(path) => EngineConfig::from_file(path)
            .unwrap_or_else(|e| fail(&format!("cannot load config {}: {}", path, e))),
        None => EngineConfig::default(),
    };
    config.apply_params(&EnvParams);
    config
}

fn retrieve_sink(path: Option<&str>) -> (SharedSink, Output) {
    match path {
        Some(path) => {
            let file = File::create(path)
                .unwrap_or_else(|e| fail(&format!("cannot create {}: {}", path, e)));
            (shared_sink(file), Output::File)
        }
        None => {
            let buf = Arc::new(Mutex::new(Cursor::new(Vec::new())));
            let sink: SharedSink = buf.clone();
            (sink, Output::Stdout(buf))
        }
    }
}

/// Starts the verb; the callback sends its outcome on `tx`.
fn start(
    handle: &Handle,
    args: &CliArgs,
    tx: mpsc::Sender<Outcome>,
) -> Result<Output, ClientError> {
    let done = move |result: Outcome| {
        let _ = tx.send(result);
    };
    let url = args.url.as_str();
    let second = args.second.as_deref();
    match args.verb {
        Verb::Get => {
            let (sink, output) = retrieve_sink(second);
            handle.get(url, None, None, sink, done)?;
            Ok(output)
        }
        Verb::List => {
            let (sink, output) = retrieve_sink(None);
            handle.list(url, None, sink, done)?;
            Ok(output)
        }
        Verb::Put => {
            let source = match second {
                Some(path) => shared_source(
                    File::open(path)
                        .unwrap_or_else(|e| fail(&format!("cannot open {}: {}", path, e))),
                ),
                None => {
                    let mut data = Vec::new();
                    io::stdin()
                        .read_to_end(&mut data)
                        .unwrap_or_else(|e| fail(&format!("cannot read stdin: {}", e)));
                    shared_source(Cursor::new(data))
                }
            };
            handle.put(url, None, None, source, done)?;
            Ok(Output::None)
        }
        Verb::Transfer => {
            let dest = second.unwrap_or_else(|| fail("transfer needs a destination url"));
            handle.third_party_transfer(url, None, dest, None, None, done)?;
            Ok(Output::None)
        }
        Verb::Mkdir => handle.mkdir(url, None, done).map(|_| Output::None),
        Verb::Rmdir => handle.rmdir(url, None, done).map(|_| Output::None),
        Verb::Delete => handle.delete(url, None, done).map(|_| Output::None),
        Verb::Size => handle.size(url, None, done).map(|_| Output::None),
        Verb::Mdtm => handle.modification_time(url, None, done).map(|_| Output::None),
        Verb::Cksm => handle
            .cksm(url, None, "MD5", 0, -1, done)
            .map(|_| Output::None),
        Verb::Feat => handle.feat(url, None, done).map(|_| Output::None),
    }
}

fn report(completion: Completion) {
    match completion {
        Completion::Done => {}
        Completion::Size(size) => println!("{}", size),
        Completion::ModificationTime(time) => println!("{}", time.format("%Y-%m-%d %H:%M:%S UTC")),
        Completion::Checksum(sum) => println!("{}", sum),
        Completion::Mlst(facts) | Completion::Stat(facts) => println!("{}", facts),
        Completion::Cwd(dir) => println!("{}", dir.unwrap_or_default()),
        Completion::Features(features) => {
            for feature in Feature::ALL {
                let state = match features.get(feature) {
                    Tristate::True => "yes",
                    Tristate::False => "no",
                    Tristate::Unknown => "unknown",
                };
                println!("{:?}: {}", feature, state);
            }
        }
    }
}

fn main() {
    let args = parse_args();
    if let Some(log_file) = &args.log_file {
        if let Err(e) = logging::set_log_file(log_file) {
            fail(&format!("cannot use log file {}: {}", log_file, e));
        }
    }
    if args.debug {
        logging::set_level(Level::Debug);
    }

    let handle = Handle::new(Arc::new(load_config(&args)));
    if args.debug {
        let _ = handle.add_plugin(Arc::new(DebugPlugin::new()));
    }
    if args.retries != 0 {
        let _ = handle.add_plugin(Arc::new(RestartPlugin::new(
            args.retries,
            Duration::from_secs(1),
            true,
        )));
    }
    if let Err(e) = shutdown::abort_on_signal(handle.clone()) {
        fail(&format!("cannot install signal handler: {}", e));
    }

    let (tx, rx) = mpsc::channel();
    let output = start(&handle, &args, tx).unwrap_or_else(|e| fail(&e.to_string()));
    let result = rx
        .recv()
        .unwrap_or_else(|_| fail("operation ended without a result"));

    match result {
        Ok(completion) => {
            if let Output::Stdout(buf) = output {
                let buf = buf.lock().unwrap_or_else(PoisonError::into_inner);
                let mut stdout = io::stdout();
                if let Err(e) = stdout.write_all(buf.get_ref()).and_then(|_| stdout.flush()) {
                    fail(&format!("cannot write output: {}", e));
                }
            }
            report(completion);
        }
        Err(ClientError::OperationAborted) if shutdown::is_shutdown_requested() => {
            let _ = logging::log("interrupted");
            process::exit(130);
        }
        Err(e) => fail(&e.to_string()),
    }
}
