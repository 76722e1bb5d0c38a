use crate::router::Router;
use anyhow::Result;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::cell::Cell;

pub struct Context {
    pub router: Router,
    /// Identity the operator is currently typing as
    pub current_user: Cell<Option<i64>>,
}

/// Console-only commands, handled before anything reaches the router
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsoleCommand {
    Exit,
    As(i64),
    WhoAmI,
    BadAs,
}

fn console_command(line: &str) -> Option<ConsoleCommand> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        ["/exit"] | ["/quit"] => Some(ConsoleCommand::Exit),
        ["/whoami"] => Some(ConsoleCommand::WhoAmI),
        ["/as", id] => Some(
            id.parse::<i64>()
                .map(ConsoleCommand::As)
                .unwrap_or(ConsoleCommand::BadAs),
        ),
        ["/as", ..] => Some(ConsoleCommand::BadAs),
        _ => None,
    }
}

pub fn run_once(ctx: &Context, user_id: i64, line: &str) -> Result<()> {
    println!("{}", ctx.router.handle(user_id, line));
    Ok(())
}

pub fn run_repl(ctx: &Context) -> Result<()> {
    let mut rl = DefaultEditor::new()?;

    println!("warden - /as <user_id> to pick an identity, /help for commands, /exit to quit");

    loop {
        let prompt = match ctx.current_user.get() {
            Some(id) => format!("[{}]> ", id),
            None => "[?]> ".to_string(),
        };
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                rl.add_history_entry(line)?;

                match console_command(line) {
                    Some(ConsoleCommand::Exit) => break,
                    Some(ConsoleCommand::As(id)) => {
                        ctx.current_user.set(Some(id));
                        println!("Now acting as user {}", id);
                    }
                    Some(ConsoleCommand::WhoAmI) => match ctx.current_user.get() {
                        Some(id) => println!("User {}", id),
                        None => println!("No identity set"),
                    },
                    Some(ConsoleCommand::BadAs) => println!("Usage: /as <user_id>"),
                    None => match ctx.current_user.get() {
                        Some(id) => println!("{}", ctx.router.handle(id, line)),
                        None => println!("Set an identity first with /as <user_id>"),
                    },
                }
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Input error: {}", e);
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_commands() {
        assert_eq!(console_command("/exit"), Some(ConsoleCommand::Exit));
        assert_eq!(console_command("/quit"), Some(ConsoleCommand::Exit));
        assert_eq!(console_command("/as 42"), Some(ConsoleCommand::As(42)));
        assert_eq!(console_command("/as bob"), Some(ConsoleCommand::BadAs));
        assert_eq!(console_command("/as"), Some(ConsoleCommand::BadAs));
        assert_eq!(console_command("/whoami"), Some(ConsoleCommand::WhoAmI));
        // everything else belongs to the router
        assert_eq!(console_command("/approve 42 2d"), None);
        assert_eq!(console_command("127.0.0.1 8080 60"), None);
    }
}
