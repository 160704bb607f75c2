//! The textual command interpreter: the `q`/`a`/`d`/`f` verb grammar that
//! drives the tree engine. This is the external collaborator spec.md scopes
//! out of the core — parsing, response formatting, and file-driven
//! recursion all live here, not in [`crate::tree`].

use std::fs;

use crate::tree::{AddOutcome, QueryOutcome, RemoveOutcome, Tree, TreeError};

/// A parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `q <name>`
    Query(String),
    /// `a <name> <value>`
    Add(String, String),
    /// `d <name>`
    Delete(String),
    /// `f <path>` — silently run every line of the named file as a command.
    RunFile(String),
}

/// Errors produced while parsing or dispatching a command line.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("ill-formed command")]
    IllFormed,
    #[error("bad file name")]
    BadFile,
}

/// Parses one command line. Mirrors `interpret_command`'s verb dispatch:
/// the first byte selects the verb, the rest is whitespace-separated
/// arguments.
pub fn parse(line: &str) -> Result<Command, CommandError> {
    let line = line.trim_end_matches(['\n', '\r']);
    if line.len() <= 1 {
        return Err(CommandError::IllFormed);
    }

    let verb = line.as_bytes()[0];
    let mut args = line[1..].split_whitespace();

    match verb {
        b'q' => {
            let name = args.next().ok_or(CommandError::IllFormed)?;
            Ok(Command::Query(name.to_owned()))
        }
        b'a' => {
            let name = args.next().ok_or(CommandError::IllFormed)?;
            let value = args.next().ok_or(CommandError::IllFormed)?;
            Ok(Command::Add(name.to_owned(), value.to_owned()))
        }
        b'd' => {
            let name = args.next().ok_or(CommandError::IllFormed)?;
            Ok(Command::Delete(name.to_owned()))
        }
        b'f' => {
            let name = args.next().ok_or(CommandError::IllFormed)?;
            Ok(Command::RunFile(name.to_owned()))
        }
        _ => Err(CommandError::IllFormed),
    }
}

/// Runs one command line against `tree` and returns the textual response.
///
/// Recurses for the `f` verb exactly as `interpret_command` does in the
/// reference driver; this is sound to do without holding any lock across
/// the recursion because `Tree::query`/`add`/`remove` release every lock
/// they take before returning (the core's lock-hygiene property).
pub fn execute(tree: &Tree, line: &str) -> String {
    let command = match parse(line) {
        Ok(command) => command,
        Err(e) => return e.to_string(),
    };

    match command {
        Command::Query(name) => match tree.query(&name) {
            Ok(QueryOutcome::Found(value)) => value,
            Ok(QueryOutcome::NotFound) => "not found".to_owned(),
            Err(TreeError::EmptyKey) => {
                tracing::warn!("query rejected: empty key");
                "ill-formed command".to_owned()
            }
            Err(e) => {
                tracing::warn!(error = %e, "query failed");
                e.to_string()
            }
        },
        Command::Add(name, value) => match tree.add(&name, &value) {
            Ok(AddOutcome::Added) => "added".to_owned(),
            Ok(AddOutcome::AlreadyPresent) => "already in database".to_owned(),
            Err(TreeError::AllocationFailed) => {
                tracing::warn!(%name, "add failed: allocation exhausted");
                "resource exhausted".to_owned()
            }
            Err(e) => {
                tracing::warn!(error = %e, "add rejected");
                "ill-formed command".to_owned()
            }
        },
        Command::Delete(name) => match tree.remove(&name) {
            Ok(RemoveOutcome::Removed) => "removed".to_owned(),
            Ok(RemoveOutcome::NotPresent) => "not in database".to_owned(),
            Err(e) => {
                tracing::warn!(error = %e, "delete rejected");
                "ill-formed command".to_owned()
            }
        },
        Command::RunFile(path) => run_file(tree, &path),
    }
}

fn run_file(tree: &Tree, path: &str) -> String {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            tracing::warn!(%path, error = %e, "could not open command file");
            return CommandError::BadFile.to_string();
        }
    };

    for line in contents.lines() {
        let _ = execute(tree, line);
    }

    "file processed".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_every_verb() {
        assert_eq!(parse("qapple").unwrap(), Command::Query("apple".into()));
        assert_eq!(
            parse("aapple red").unwrap(),
            Command::Add("apple".into(), "red".into())
        );
        assert_eq!(parse("dapple").unwrap(), Command::Delete("apple".into()));
        assert_eq!(
            parse("fcommands.txt").unwrap(),
            Command::RunFile("commands.txt".into())
        );
    }

    #[test]
    fn rejects_ill_formed_commands() {
        assert_eq!(parse(""), Err(CommandError::IllFormed));
        assert_eq!(parse("q"), Err(CommandError::IllFormed));
        assert_eq!(parse("zapple"), Err(CommandError::IllFormed));
        assert_eq!(parse("aapple"), Err(CommandError::IllFormed));
    }

    #[test]
    fn end_to_end_add_query_delete() {
        let tree = Tree::new();
        assert_eq!(execute(&tree, "aapple red"), "added");
        assert_eq!(execute(&tree, "aapple green"), "already in database");
        assert_eq!(execute(&tree, "qapple"), "red");
        assert_eq!(execute(&tree, "dapple"), "removed");
        assert_eq!(execute(&tree, "qapple"), "not found");
        assert_eq!(execute(&tree, "dapple"), "not in database");
    }

    #[test]
    fn run_file_processes_each_line() {
        let tree = Tree::new();
        let mut path = std::env::temp_dir();
        path.push(format!(
            "fairtree-db-test-{}-{:?}.txt",
            std::process::id(),
            std::thread::current().id()
        ));
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "aapple red").unwrap();
        writeln!(file, "abanana yellow").unwrap();
        drop(file);

        let response = execute(&tree, &format!("f{}", path.display()));
        assert_eq!(response, "file processed");
        assert_eq!(execute(&tree, "qapple"), "red");
        assert_eq!(execute(&tree, "qbanana"), "yellow");

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn run_file_reports_missing_file() {
        let tree = Tree::new();
        let response = execute(&tree, "f/nonexistent/path/to/a/file");
        assert_eq!(response, "bad file name");
    }
}
