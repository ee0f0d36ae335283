#![forbid(unsafe_code)]
//! Interactive shell for MonoFS images.
//!
//! Mounts (or creates) an image file and drives the engine with UNIX-like
//! commands: `format`, `cp`, `mv`, `rm`, `mkdir`, `rmdir`, `ls`, `cat`,
//! `cd`, `pwd`, `info`, `statfs`, `incp`, `outcp`, `load`, `ln`, `exit`.
//!
//! The shell owns stdin/stdout; the engine never prints. Engine errors are
//! rendered as `Error: <message>`; a wrong number of arguments yields a
//! usage string instead of an error.

use anyhow::{Context, Result};
use clap::Parser;
use mfs::Filesystem;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mfs", about = "MonoFS — a single-image block filesystem shell")]
struct Cli {
    /// Path to the filesystem image (created when absent).
    image: PathBuf,
    /// Script to run before entering the interactive loop.
    #[arg(long)]
    script: Option<PathBuf>,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let fs = Filesystem::mount(&cli.image)
        .with_context(|| format!("failed to mount image {}", cli.image.display()))?;

    let mut shell = Shell::new(fs);

    if let Some(script) = &cli.script {
        let reply = shell.cmd_load(&[script.display().to_string()]);
        if reply != "OK" {
            println!("{reply}");
        }
    }

    shell.repl()?;

    shell.close()?;
    Ok(())
}

/// Reply sentinel that terminates the interactive loop.
const EXIT: &str = "exit";

struct Shell {
    fs: Filesystem,
}

impl Shell {
    fn new(fs: Filesystem) -> Self {
        Self { fs }
    }

    fn close(self) -> Result<()> {
        self.fs.close().context("failed to close image")?;
        Ok(())
    }

    /// Read-eval-print loop; ends on EOF or `exit`.
    fn repl(&mut self) -> Result<()> {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        let mut cwd = self.pwd();

        loop {
            write!(stdout, "{cwd} > ")?;
            stdout.flush()?;

            let mut line = String::new();
            if stdin.lock().read_line(&mut line)? == 0 {
                break;
            }
            if line.trim().is_empty() {
                continue;
            }

            let reply = self.execute(&line);
            cwd = self.pwd();
            if reply == EXIT {
                break;
            }
            writeln!(stdout, "{reply}")?;
        }
        Ok(())
    }

    /// Execute one command line and return the reply text.
    fn execute(&mut self, line: &str) -> String {
        let mut words = line.split_whitespace();
        let Some(cmd) = words.next() else {
            return String::new();
        };
        let args: Vec<String> = words.map(str::to_owned).collect();

        if !self.fs.is_formatted() && !matches!(cmd, "format" | "load" | "exit") {
            return "Filesystem not formatted".to_owned();
        }

        match cmd {
            "format" => self.cmd_format(&args),
            "cp" => self.cmd_cp(&args),
            "mv" => self.cmd_mv(&args),
            "rm" => self.cmd_rm(&args),
            "mkdir" => self.cmd_mkdir(&args),
            "rmdir" => self.cmd_rmdir(&args),
            "ls" => self.cmd_ls(&args),
            "cat" => self.cmd_cat(&args),
            "cd" => self.cmd_cd(&args),
            "pwd" => self.pwd(),
            "info" => self.cmd_info(&args),
            "statfs" => self.cmd_statfs(&args),
            "incp" => self.cmd_incp(&args),
            "outcp" => self.cmd_outcp(&args),
            "load" => self.cmd_load(&args),
            "ln" => self.cmd_ln(&args),
            "exit" => EXIT.to_owned(),
            _ => "Unknown command".to_owned(),
        }
    }

    fn render(result: mfs_error::Result<String>) -> String {
        match result {
            Ok(msg) => msg,
            Err(err) => format!("Error: {err}"),
        }
    }

    fn pwd(&self) -> String {
        match self.fs.current_path() {
            Ok(parts) if parts.is_empty() => "/".to_owned(),
            Ok(parts) => format!("/{}", parts.join("/")),
            Err(_) => "/".to_owned(),
        }
    }

    fn cmd_format(&mut self, args: &[String]) -> String {
        if args.len() != 1 {
            return "Usage: format <size>".to_owned();
        }
        let Some(bytes) = parse_size(&args[0]) else {
            return "Error: invalid size".to_owned();
        };
        Self::render(self.fs.format(bytes).map(|()| "Filesystem formatted".to_owned()))
    }

    fn cmd_cp(&mut self, args: &[String]) -> String {
        if args.len() != 2 {
            return "Usage: cp <src> <dst>".to_owned();
        }
        Self::render(
            self.fs
                .copy_file(&args[0], &args[1])
                .map(|()| "Copied successfully".to_owned()),
        )
    }

    fn cmd_mv(&mut self, args: &[String]) -> String {
        if args.len() != 2 {
            return "Usage: mv <src> <dst>".to_owned();
        }
        Self::render(
            self.fs
                .move_file(&args[0], &args[1])
                .map(|()| "Moved successfully".to_owned()),
        )
    }

    fn cmd_rm(&mut self, args: &[String]) -> String {
        if args.len() != 1 {
            return "Usage: rm <file>".to_owned();
        }
        Self::render(self.fs.remove_file(&args[0]).map(|()| "File removed".to_owned()))
    }

    fn cmd_mkdir(&mut self, args: &[String]) -> String {
        if args.len() != 1 {
            return "Usage: mkdir <dir>".to_owned();
        }
        Self::render(
            self.fs
                .create_directory(&args[0])
                .map(|()| "Directory created".to_owned()),
        )
    }

    fn cmd_rmdir(&mut self, args: &[String]) -> String {
        if args.len() != 1 {
            return "Usage: rmdir <dir>".to_owned();
        }
        Self::render(
            self.fs
                .remove_directory(&args[0])
                .map(|()| "Directory removed".to_owned()),
        )
    }

    fn cmd_ls(&self, args: &[String]) -> String {
        let path = args.first().map_or(".", String::as_str);
        Self::render(self.fs.list_directory(path).map(|entries| {
            let mut out = String::new();
            for entry in entries {
                out.push_str(if entry.is_dir { "[D] " } else { "[F] " });
                out.push_str(&entry.name);
                out.push('\n');
            }
            out
        }))
    }

    fn cmd_cat(&self, args: &[String]) -> String {
        if args.len() != 1 {
            return "Usage: cat <file>".to_owned();
        }
        Self::render(
            self.fs
                .read_file(&args[0])
                .map(|data| String::from_utf8_lossy(&data).into_owned()),
        )
    }

    fn cmd_cd(&mut self, args: &[String]) -> String {
        if args.len() != 1 {
            return "Usage: cd <dir>".to_owned();
        }
        Self::render(self.fs.change_directory(&args[0]).map(|()| String::new()))
    }

    fn cmd_info(&self, args: &[String]) -> String {
        if args.len() != 1 {
            return "Usage: info <path>".to_owned();
        }
        Self::render(self.fs.node_info(&args[0]))
    }

    fn cmd_statfs(&self, _args: &[String]) -> String {
        Self::render(self.fs.stats())
    }

    /// Import a host file into the filesystem.
    fn cmd_incp(&mut self, args: &[String]) -> String {
        if args.len() != 2 {
            return "Usage: incp <host_file> <fs_path>".to_owned();
        }
        let Ok(data) = std::fs::read(&args[0]) else {
            return "Could not open host file".to_owned();
        };
        Self::render(
            self.fs
                .write_file(&args[1], &data)
                .map(|()| "Imported file".to_owned()),
        )
    }

    /// Export a filesystem file to the host.
    fn cmd_outcp(&self, args: &[String]) -> String {
        if args.len() != 2 {
            return "Usage: outcp <fs_file> <host_path>".to_owned();
        }
        let data = match self.fs.read_file(&args[0]) {
            Ok(data) => data,
            Err(err) => return format!("Error: {err}"),
        };
        if std::fs::write(&args[1], data).is_err() {
            return "Could not create host file".to_owned();
        }
        "Exported file".to_owned()
    }

    /// Run a command script line by line. Halts on the first error reply or
    /// unknown command, and on `exit`.
    fn cmd_load(&mut self, args: &[String]) -> String {
        if args.len() != 1 {
            return "Usage: load <script_file>".to_owned();
        }
        let Ok(script) = std::fs::read_to_string(&args[0]) else {
            return "FILE NOT FOUND".to_owned();
        };

        for line in script.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let reply = self.execute(line);
            if reply == EXIT {
                break;
            }
            if reply.starts_with("Error") || reply == "Unknown command" {
                return reply;
            }
        }
        "OK".to_owned()
    }

    fn cmd_ln(&mut self, args: &[String]) -> String {
        if args.len() != 2 {
            return "Usage: ln <target> <link>".to_owned();
        }
        Self::render(
            self.fs
                .link_file(&args[0], &args[1])
                .map(|()| "Link created".to_owned()),
        )
    }
}

/// Parse a human-readable size string into bytes.
///
/// A decimal integer with an optional case-insensitive suffix in
/// {B, KB, MB, GB}, powers of 1024. Overflow returns `None`.
fn parse_size(input: &str) -> Option<u64> {
    let digits_end = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    if digits_end == 0 {
        return None;
    }

    let value: u64 = input[..digits_end].parse().ok()?;
    let suffix = input[digits_end..].to_ascii_uppercase();

    let multiplier: u64 = match suffix.as_str() {
        "" | "B" => 1,
        "KB" => 1024,
        "MB" => 1024 * 1024,
        "GB" => 1024 * 1024 * 1024,
        _ => return None,
    };

    value.checked_mul(multiplier)
}
