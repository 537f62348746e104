use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use formsync::transport::ConnectionState;
use formsync::transport::ws::{self, Command as DriverCommand, TungsteniteConnector};
use formsync::{ClientValue, ConnectionListener, Endpoint, SyncClient, SyncConfig, SyncError};
use frames::RawFrame;
use futures::channel::mpsc;
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("invalid JSON argument: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("frame decode failed: {0}")]
    Decode(#[from] frames::CodecError),
    #[error("expected a JSON array of arguments, got {0}")]
    NotAnArray(Value),
}

#[derive(Parser, Debug)]
#[command(name = "formsync", about = "Command-line peer for the form synchronization protocol")]
struct Cli {
    #[arg(long, env = "FORMSYNC_URL", default_value = "ws://127.0.0.1:8080/websocket")]
    url: String,

    #[arg(long, env = "FORMSYNC_CLIENT", default_value = "app")]
    client: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load forms and print their models whenever they change.
    Watch(WatchArgs),
    /// Call a server service and print the result.
    Call(CallArgs),
    /// Run a component event handler on the server.
    Event(EventArgs),
    /// Classify and decode one frame offline.
    Decode {
        frame: String,
    },
}

#[derive(Args, Debug)]
struct WatchArgs {
    #[arg(required = true)]
    forms: Vec<String>,

    #[arg(long, default_value_t = 250)]
    poll_ms: u64,
}

#[derive(Args, Debug)]
struct CallArgs {
    service: String,
    method: String,

    #[arg(long, default_value = "[]", help = "Arguments as a JSON value")]
    args: String,

    #[arg(long, default_value_t = false, help = "Send without waiting for a reply")]
    no_wait: bool,
}

#[derive(Args, Debug)]
struct EventArgs {
    form: String,
    component: String,
    handler: String,

    #[arg(long, default_value = "[]", help = "Handler arguments as a JSON array")]
    args: String,
}

/// Logs connection transitions.
struct StateLogger;

impl ConnectionListener for StateLogger {
    fn state_changed(&self, from: ConnectionState, to: ConnectionState) {
        tracing::info!(%from, %to, "connection");
    }

    fn reload_required(&self) {
        tracing::warn!("server requested a full reload; restart the watch");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    if let Command::Decode { frame } = &cli.command {
        return decode(frame);
    }

    let endpoint = Endpoint::parse(&cli.url, &cli.client)?;
    let mut client = SyncClient::new(SyncConfig::from_env(), endpoint);
    client.set_connection_listener(StateLogger);

    match cli.command {
        Command::Watch(args) => watch(client, args).await,
        Command::Call(args) => call(client, args).await,
        Command::Event(args) => event(client, args).await,
        Command::Decode { .. } => Ok(()),
    }
}

async fn watch(mut client: SyncClient, args: WatchArgs) -> Result<(), CliError> {
    for form in &args.forms {
        client.init_form_state(form, [], Map::new());
        client.request_initial_data(form);
    }

    let (commands, command_rx) = mpsc::unbounded::<DriverCommand>();
    let poll = Duration::from_millis(args.poll_ms);
    let forms = Rc::new(args.forms);
    let printer = async move {
        let printed = Rc::new(RefCell::new(HashMap::<String, Value>::new()));
        let mut interval = tokio::time::interval(poll);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = tokio::signal::ctrl_c() => break,
            }
            let (forms, printed) = (Rc::clone(&forms), Rc::clone(&printed));
            let print = Box::new(move |client: &mut SyncClient| {
                print_changed_forms(client, &forms, &mut printed.borrow_mut());
            });
            if commands.unbounded_send(print).is_err() {
                break;
            }
        }
    };

    let mut connector = TungsteniteConnector;
    futures::join!(ws::run(&mut client, &mut connector, command_rx), printer);
    Ok(())
}

fn print_changed_forms(client: &SyncClient, forms: &[String], printed: &mut HashMap<String, Value>) {
    for name in forms {
        let Some(state) = client.forms().get(name) else {
            continue;
        };
        let model = state
            .components()
            .into_iter()
            .filter_map(|component| Some((component.clone(), Value::Object(state.component_json(&component)?))))
            .collect::<Map<_, _>>();
        let model = Value::Object(model);
        if printed.get(name) != Some(&model) {
            println!("{name}: {model}");
            printed.insert(name.clone(), model);
        }
    }
}

async fn call(mut client: SyncClient, args: CallArgs) -> Result<(), CliError> {
    let payload: Value = serde_json::from_str(&args.args)?;
    let handle = client.call_service(&args.service, &args.method, payload, args.no_wait);
    let (commands, command_rx) = mpsc::unbounded::<DriverCommand>();

    let outcome = async move {
        let result = match handle {
            Some(handle) => handle.await.map(Some),
            None => Ok(None),
        };
        // Let the driver flush what is queued, then stop it.
        let _ = commands.unbounded_send(Box::new(SyncClient::disconnect));
        result
    };

    let mut connector = TungsteniteConnector;
    let ((), result) = futures::join!(ws::run(&mut client, &mut connector, command_rx), outcome);
    if let Some(value) = result? {
        println!("{}", value.to_json());
    }
    Ok(())
}

async fn event(mut client: SyncClient, args: EventArgs) -> Result<(), CliError> {
    let values = match serde_json::from_str::<Value>(&args.args)? {
        Value::Array(values) => values.into_iter().map(ClientValue::from).collect::<Vec<_>>(),
        other => return Err(CliError::NotAnArray(other)),
    };
    client.init_form_state(&args.form, [], Map::new());
    let handle = client.execute_event(&args.form, &args.component, &args.handler, &values)?;
    let (commands, command_rx) = mpsc::unbounded::<DriverCommand>();

    let outcome = async move {
        let result = handle.await;
        let _ = commands.unbounded_send(Box::new(SyncClient::disconnect));
        result
    };

    let mut connector = TungsteniteConnector;
    let ((), result) = futures::join!(ws::run(&mut client, &mut connector, command_rx), outcome);
    println!("{}", result?.to_json());
    Ok(())
}

fn decode(frame: &str) -> Result<(), CliError> {
    match frames::split_frame(frame)? {
        RawFrame::Ping => println!("heartbeat ping"),
        RawFrame::Pong => println!("heartbeat pong"),
        RawFrame::Message { seq, body } => {
            let envelope = frames::decode_envelope(body)?;
            if let Some(seq) = seq {
                println!("sequence: {seq}");
            }
            println!("{envelope:#?}");
        }
    }
    Ok(())
}
