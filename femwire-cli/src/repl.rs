//! Interactive REPL.

use crate::commands;
use colored::Colorize;
use femwire_client::Session;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};

const HELP_TEXT: &str = r#"
Available commands:
  help                     Show this help
  ping                     Ping the engine

  param <name>             Read a scalar parameter
  info <name>              Show workspace object metadata
  show <name>              Download and print a vector or matrix
  status                   Workspace status listing

  mesh                     Summarize the engine mesh
  refresh                  Drop the cached mesh
  files                    List engine files
  upload <path>            Upload a local file
  download <file> [dest]   Download an engine file

  quit, exit               Exit the REPL

Anything else is sent to the engine as a command line, e.g.
  *VEC,V,D,ALLOC,10
"#;

pub fn run(session: &Session) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "femwire CLI".bold().cyan());

    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(config)?;

    let history_path = std::env::var("HOME")
        .map(|h| std::path::PathBuf::from(h).join(".femwire_history"))
        .unwrap_or_else(|_| ".femwire_history".into());
    let _ = rl.load_history(&history_path);

    println!("Type 'help' for available commands.\n");

    loop {
        let prompt = format!("{} ", "femwire>".cyan());
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match execute_repl_command(session, line) {
                    Ok(Some(output)) => println!("{}\n", output),
                    Ok(None) => break,
                    Err(e) => println!("{}: {}\n", "Error".red(), e),
                }
                if !session.is_alive() {
                    println!("{}", "Session terminated.".red());
                    break;
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                println!("{}: {:?}", "Error".red(), err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);
    println!("{}", "Disconnected.".dimmed());

    Ok(())
}

fn execute_repl_command(
    session: &Session,
    line: &str,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let cmd = parts[0].to_lowercase();
    let args = &parts[1..];

    match cmd.as_str() {
        "help" | "?" => Ok(Some(HELP_TEXT.to_string())),

        "quit" | "exit" | "q" => Ok(None),

        "ping" => {
            session.ping()?;
            Ok(Some("PONG".green().to_string()))
        }

        "param" | "p" => match args.first() {
            Some(name) => commands::param(session, name).map(Some),
            None => Ok(Some("Usage: param <name>".to_string())),
        },

        "info" | "i" => match args.first() {
            Some(name) => Ok(Some(commands::format_info(&session.data_info(name)?))),
            None => Ok(Some("Usage: info <name>".to_string())),
        },

        "show" | "s" => match args.first() {
            Some(name) => commands::show(session, name).map(Some),
            None => Ok(Some("Usage: show <name>".to_string())),
        },

        "status" => Ok(Some(session.run("*STATUS")?)),

        "mesh" => commands::mesh(session).map(Some),

        "refresh" => {
            session.mesh().invalidate();
            Ok(Some("Mesh cache cleared".dimmed().to_string()))
        }

        "files" => commands::files(session).map(Some),

        "upload" => match args.first() {
            Some(path) => {
                let filename = session.upload_file(path)?;
                Ok(Some(format!("{} {}", "Uploaded".green(), filename.cyan())))
            }
            None => Ok(Some("Usage: upload <path>".to_string())),
        },

        "download" => match args.first() {
            Some(filename) => {
                let dest = args.get(1).copied().unwrap_or(".");
                let target = session.download_file(filename, dest)?;
                Ok(Some(format!("{} {}", "Downloaded".green(), target.display())))
            }
            None => Ok(Some("Usage: download <file> [dest]".to_string())),
        },

        _ => commands::run(session, line).map(Some),
    }
}
