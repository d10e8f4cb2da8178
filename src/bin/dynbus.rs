use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use dynbus::{AppValue, Bus, Connection, Message, NameFlags};

#[derive(Clone, Copy, ValueEnum)]
enum BusArg {
    Session,
    System,
    Starter,
}

impl From<BusArg> for Bus {
    fn from(bus: BusArg) -> Bus {
        match bus {
            BusArg::Session => Bus::Session,
            BusArg::System => Bus::System,
            BusArg::Starter => Bus::Starter,
        }
    }
}

#[derive(Parser)]
#[command(name = "dynbus", about = "Talk to a DBus bus with JSON values")]
struct Cli {
    #[arg(long, value_enum, default_value = "session")]
    bus: BusArg,
    /// Reply timeout in milliseconds.
    #[arg(long, default_value_t = 25_000)]
    timeout: u64,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Call a method and print its reply as JSON.
    Call {
        destination: String,
        path: String,
        interface: String,
        method: String,
        /// Argument signature, such as `sa{sv}`.
        #[arg(long, default_value = "")]
        signature: String,
        /// Arguments as a JSON array.
        #[arg(long, default_value = "[]")]
        args: String,
    },
    /// Print messages matching a rule as they arrive.
    Monitor {
        #[arg(default_value = "type='signal'")]
        rule: String,
        /// Stop after this many messages.
        #[arg(long)]
        count: Option<usize>,
    },
    RequestName {
        name: String,
        #[arg(long)]
        allow_replacement: bool,
        #[arg(long)]
        replace_existing: bool,
        #[arg(long)]
        do_not_queue: bool,
    },
    HasOwner {
        name: String,
    },
}

fn print_message(message: &Message) -> dynbus::Result<()> {
    let args = serde_json::to_string(&message.app_args())
        .map_err(|e| dynbus::Error::Serializing(e.to_string()))?;
    println!("{}\n  {}", message, args);
    Ok(())
}

fn main() {
    pretty_env_logger::init();
    if let Err(err) = run() {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

fn run() -> dynbus::Result<()> {
    let cli = Cli::parse();
    let mut connection = Connection::default();
    connection.set_default_timeout(Duration::from_millis(cli.timeout));
    connection.connect(cli.bus.into())?;

    match cli.command {
        Commands::Call {
            destination,
            path,
            interface,
            method,
            signature,
            args,
        } => {
            let args: Vec<AppValue> = serde_json::from_str(&args)
                .map_err(|e| dynbus::Error::Deserializing(e.to_string()))?;
            let reply = connection.send_with_reply_and_block(
                &destination,
                &path,
                &interface,
                &method,
                &args,
                &signature,
            )?;
            print_message(&reply)
        }
        Commands::Monitor { rule, count } => {
            connection.add_match(&rule)?;
            let mut seen = 0;
            while count.map_or(true, |count| seen < count) {
                match connection.pop_message()? {
                    Some(message) => {
                        print_message(&message)?;
                        seen += 1;
                    }
                    None => std::thread::sleep(Duration::from_millis(50)),
                }
            }
            Ok(())
        }
        Commands::RequestName {
            name,
            allow_replacement,
            replace_existing,
            do_not_queue,
        } => {
            let mut flags = NameFlags::empty();
            flags.set(NameFlags::ALLOW_REPLACEMENT, allow_replacement);
            flags.set(NameFlags::REPLACE_EXISTING, replace_existing);
            flags.set(NameFlags::DO_NOT_QUEUE, do_not_queue);
            println!("{:?}", connection.request_name(&name, flags)?);
            Ok(())
        }
        Commands::HasOwner { name } => {
            println!("{}", connection.name_has_owner(&name)?);
            Ok(())
        }
    }
}
