//! Terminal adapters for the capture session: keyboard trigger, prompts and
//! status output.

use facegate_core::decision::{is_affirmative, Prompt};
use facegate_core::session::{Command, EventSink, SessionEvent, Trigger};
use std::io::{BufRead, Write};
use std::sync::mpsc::{self, Receiver, TryRecvError};

/// Keyboard console fed by a stdin reader thread.
///
/// Between captures a line is a command (empty line = capture, `q` = quit);
/// during a prompt it is the answer. Closing stdin quits.
pub struct Console {
    lines: Receiver<String>,
}

impl Console {
    /// Start reading stdin on a background thread.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
            tracing::debug!("stdin closed");
        });
        Self::from_receiver(rx)
    }

    pub fn from_receiver(lines: Receiver<String>) -> Self {
        Self { lines }
    }

    fn ask(&mut self, question: &str) -> Option<String> {
        print!("{question} ");
        let _ = std::io::stdout().flush();
        self.lines.recv().ok()
    }
}

impl Trigger for Console {
    fn poll(&mut self) -> Command {
        match self.lines.try_recv() {
            Ok(line) => match line.trim() {
                "" | "c" => Command::Capture,
                "q" | "quit" => Command::Quit,
                other => {
                    println!("unknown command {other:?} (Enter = capture, q = quit)");
                    Command::Idle
                }
            },
            Err(TryRecvError::Empty) => Command::Idle,
            Err(TryRecvError::Disconnected) => Command::Quit,
        }
    }
}

impl Prompt for Console {
    fn confirm(&mut self, question: &str) -> bool {
        self.ask(question).is_some_and(|answer| is_affirmative(&answer))
    }

    fn ask_text(&mut self, question: &str) -> String {
        self.ask(question).unwrap_or_default()
    }
}

/// Prints session events to stdout.
pub struct StdoutEvents;

impl EventSink for StdoutEvents {
    fn report(&mut self, event: SessionEvent) {
        println!("{event}");
    }
}
