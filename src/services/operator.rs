//! Operator commands - one line of console input
//!
//! Indices typed by the operator are 1-based, the way the list is printed.

use crate::domain::master::MasterEntry;
use crate::domain::types::SwitchId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    Help,
    List,
    Add(String),
    Load(String),
    Remove(usize),
    Up(usize),
    Down(usize),
    Clear,
    Start,
    Stop,
    Status,
    Switch(SwitchId),
    Save(Option<String>),
    /// Feed a line into an in-process port (dry run only)
    Scan { port: String, value: String },
    Quit,
}

pub const HELP: &str = "\
commands:
  list                 show the master sequence
  add <code>           append one barcode
  load <file>          append one barcode per line of a file
  remove <n>           remove entry n
  up <n> | down <n>    move entry n
  clear                empty the master sequence
  start | stop         start or stop listening
  status               listener state and counters
  switch <1|2>         relay used by the next start
  save [path]          write the configuration
  scan <port> <code>   feed a scan (dry run)
  quit";

impl OperatorCommand {
    /// Parse one console line; `Ok(None)` for a blank line
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let rest: Vec<&str> = words.collect();

        let command = match (verb.to_ascii_lowercase().as_str(), rest.as_slice()) {
            ("help" | "?", []) => OperatorCommand::Help,
            ("list" | "ls", []) => OperatorCommand::List,
            ("add", [code]) => OperatorCommand::Add(code.to_string()),
            ("load", [path]) => OperatorCommand::Load(path.to_string()),
            ("remove" | "rm", [n]) => OperatorCommand::Remove(parse_position(n)?),
            ("up", [n]) => OperatorCommand::Up(parse_position(n)?),
            ("down", [n]) => OperatorCommand::Down(parse_position(n)?),
            ("clear", []) => OperatorCommand::Clear,
            ("start", []) => OperatorCommand::Start,
            ("stop", []) => OperatorCommand::Stop,
            ("status", []) => OperatorCommand::Status,
            ("switch", [n]) => {
                let number: u8 = n.parse().map_err(|_| format!("not a switch number: {}", n))?;
                OperatorCommand::Switch(SwitchId::try_from(number)?)
            }
            ("save", []) => OperatorCommand::Save(None),
            ("save", [path]) => OperatorCommand::Save(Some(path.to_string())),
            ("scan", [port, value]) => {
                OperatorCommand::Scan { port: port.to_string(), value: value.to_string() }
            }
            ("quit" | "exit", []) => OperatorCommand::Quit,
            _ => return Err(format!("unknown command: {} (try `help`)", line.trim())),
        };
        Ok(Some(command))
    }
}

/// 1-based position to 0-based index
fn parse_position(word: &str) -> Result<usize, String> {
    match word.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n - 1),
        _ => Err(format!("not a list position: {}", word)),
    }
}

/// Numbered listing, matched entries marked
pub fn render_master(entries: &[MasterEntry]) -> String {
    if entries.is_empty() {
        return "(master sequence is empty)".to_string();
    }
    entries
        .iter()
        .enumerate()
        .map(|(i, e)| format!("{:>3}. [{}] {}", i + 1, if e.is_matched() { "x" } else { " " }, e.value))
        .collect::<Vec<_>>()
        .join("\n")
}
