//! Operator console: line commands read from stdin.

use std::{
    io::{self, BufRead},
    thread,
};

use crossbeam_channel::Sender;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Calibrate the distance against the engaged peer.
    Calibrate,
    Quit,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "calibrate" | "c" => Some(Self::Calibrate),
            "quit" | "q" | "exit" => Some(Self::Quit),
            _ => None,
        }
    }
}

/// Spawn the stdin reader. The thread blocks on stdin and is never joined.
pub fn spawn_console(commands: Sender<ConsoleCommand>) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("v2v-console".into())
        .spawn(move || read_commands(io::stdin().lock(), &commands))
}

/// Forward commands from `input` until it ends or the receiver goes away.
pub fn read_commands<R: BufRead>(input: R, commands: &Sender<ConsoleCommand>) {
    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                warn!("console input failed: {err}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match ConsoleCommand::parse(&line) {
            Some(command) => {
                if commands.send(command).is_err() {
                    break;
                }
            }
            None => warn!(input = line.trim(), "unknown command; try `calibrate` or `quit`"),
        }
    }
    debug!("console input closed");
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use crossbeam_channel::unbounded;

    use super::*;

    #[test]
    fn commands_are_forwarded_in_order_and_noise_is_skipped() {
        let (tx, rx) = unbounded();
        read_commands(Cursor::new("calibrate\n\n  dance \nQUIT\nc\n"), &tx);
        let received: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            received,
            vec![
                ConsoleCommand::Calibrate,
                ConsoleCommand::Quit,
                ConsoleCommand::Calibrate
            ]
        );
    }

    #[test]
    fn reading_stops_when_nobody_listens() {
        let (tx, rx) = unbounded();
        drop(rx);
        read_commands(Cursor::new("quit\nquit\n"), &tx);
    }
}
