use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use trackcam::sequencer::TAKE_PICTURE_COMMAND;
use trackcam::{CommandInvocation, CommandResult};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8080";
const CALL_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("trackcam")
        .version(env!("CARGO_PKG_VERSION"))
        .about("📷 Remote function calls for the tracker camera device")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .help("Device host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Device port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true)
                .validator(|v| match v.parse::<u16>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Port must be a number between 0 and 65535".into()),
                }),
        )
        .arg(
            Arg::with_name("json")
                .long("json")
                .help("Print the raw reply")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("take-picture")
                .about("📸 Capture an image and publish the current location")
                .arg(
                    Arg::with_name("argument")
                        .help("Passed through to the device, which ignores it")
                        .index(1),
                ),
        )
        .subcommand(
            SubCommand::with_name("call")
                .about("📞 Invoke any registered function")
                .arg(
                    Arg::with_name("name")
                        .help("Function name")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::with_name("argument")
                        .help("Function argument")
                        .index(2),
                ),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
    let raw = matches.is_present("json");

    let invocation = match matches.subcommand() {
        ("take-picture", Some(sub)) => invocation_for(TAKE_PICTURE_COMMAND, sub),
        ("call", Some(sub)) => invocation_for(sub.value_of("name").unwrap_or_default(), sub),
        (other, _) => return Err(format!("unknown subcommand `{}`", other).into()),
    };

    let reply = send_invocation(host, port, &invocation).await?;
    print_reply(&invocation, &reply, raw);
    Ok(())
}

fn invocation_for(name: &str, matches: &ArgMatches) -> CommandInvocation {
    CommandInvocation::new(name, matches.value_of("argument").unwrap_or_default())
}

async fn send_invocation(
    host: &str,
    port: u16,
    invocation: &CommandInvocation,
) -> Result<String, Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", host, port);
    let stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("{} Failed to connect to device at {}", "❌".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Device is not running. Start it with:", "💡".yellow());
                eprintln!("   {}", "cargo run --bin trackcam-device".bright_cyan());
            } else {
                eprintln!("{} Network error: {}", "🔌".yellow(), e.to_string().bright_red());
            }
            return Err(e.into());
        }
    };

    let request = serde_json::to_string(invocation)?;
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    match tokio::time::timeout(CALL_TIMEOUT, async {
        writer.write_all(request.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        lines.next_line().await?.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "Device closed connection")
        })
    })
    .await
    {
        Ok(result) => Ok(result?),
        Err(_) => {
            eprintln!("{} Call timed out after {} seconds", "⏰".yellow(), CALL_TIMEOUT.as_secs());
            Err("Call timeout".into())
        }
    }
}

fn print_reply(invocation: &CommandInvocation, reply: &str, raw: bool) {
    if raw {
        println!("{}", reply);
        return;
    }

    let parsed: serde_json::Value = match serde_json::from_str(reply) {
        Ok(parsed) => parsed,
        Err(_) => {
            println!("{} Unreadable reply: {}", "❌".red(), reply);
            return;
        }
    };

    let result = parsed
        .get("result")
        .and_then(|v| v.as_i64())
        .and_then(|code| i32::try_from(code).ok())
        .map(CommandResult);

    match result {
        Some(result) if result.is_accepted() => {
            println!(
                "{} {} {} ({})",
                "✅".green(),
                invocation.name.bright_white().bold(),
                result.to_string().bright_green(),
                result.code()
            );
            if invocation.name == TAKE_PICTURE_COMMAND {
                println!("   {}", "Capture and location publish triggered".dimmed());
            }
        }
        Some(result) => {
            println!(
                "{} {} {} ({})",
                "⚠️".yellow(),
                invocation.name.bright_white().bold(),
                result.to_string().bright_red(),
                result.code()
            );
            if let Some(error) = parsed.get("error").and_then(|v| v.as_str()) {
                println!("   {}", error.yellow());
            }
        }
        None => println!("{} Reply without a result: {}", "❌".red(), reply),
    }
}
