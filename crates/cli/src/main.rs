//! # CLI - ShoalDB Interactive Shell
//!
//! A REPL over one ShoalDB store. Reads commands from stdin, runs them
//! against the engine and prints results to stdout, so it works both
//! interactively and with piped scripts.
//!
//! ## Commands
//!
//! ```text
//! PUT key value           Insert or update (SET is an alias)
//! GET key                 Look up a key (prints value or "(nil)")
//! DEL key                 Delete a key
//! BATCH +k=v -k ...       Apply puts (+) and deletes (-) atomically
//! SCAN [start] [end]      Ascending scan, start inclusive, end exclusive
//! RSCAN [start] [end]     Same range, descending
//! SNAPSHOT                Capture a read point, prints its id
//! GETAT id key            Look up a key as of snapshot `id`
//! RELEASE id              Drop snapshot `id`
//! FLUSH                   Write the mutable stage to a table
//! COMPACT [start] [end]   Compact a key range (default: everything)
//! STATS                   Per-level files and compaction I/O
//! PROP name               Print an engine property
//! DEMO                    Run a short self-checking walkthrough
//! EXIT / QUIT             Close the store and leave
//! ```
//!
//! ## Usage
//!
//! ```text
//! shoal [path]            Open (or create) the store at path
//! shoal destroy <path>    Delete the store at path
//! ```
//!
//! The path defaults to `$SHOAL_DB_PATH`, then `shoal.db`. `SHOAL_SYNC=true`
//! fsyncs every write; the `SHOAL_*` tuning variables of `Options::from_env`
//! apply as well. Log output goes to stderr, filtered by `SHOAL_LOG`
//! (default `warn`).

use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use engine::{Db, Options, ReadOptions, Snapshot, WriteBatch, WriteOptions};
use tracing_subscriber::EnvFilter;

/// Reads a configuration value from the environment, falling back to `default`.
fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("SHOAL_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("destroy") => {
            let Some(path) = args.get(1) else {
                bail!("usage: shoal destroy <path>");
            };
            engine::destroy(path, &Options::default())
                .with_context(|| format!("destroying {}", path))?;
            println!("destroyed {}", path);
            Ok(())
        }
        Some(path) => run(PathBuf::from(path)),
        None => run(PathBuf::from(env_or("SHOAL_DB_PATH", "shoal.db"))),
    }
}

fn run(path: PathBuf) -> Result<()> {
    let options = Options::from_env();
    let sync: bool = env_or("SHOAL_SYNC", "false").parse().unwrap_or(false);
    let db = Db::open(options.clone(), &path)
        .with_context(|| format!("opening {}", path.display()))?;

    println!(
        "ShoalDB started (path={}, seq={}, write_buffer={}KiB, l0_trigger={}, sync={})",
        path.display(),
        db.last_sequence(),
        options.write_buffer_size / 1024,
        options.l0_compaction_trigger,
        sync
    );
    println!("Commands: PUT key value | GET key | DEL key | BATCH +k=v -k ...");
    println!("          SCAN [start] [end] | RSCAN [start] [end]");
    println!("          SNAPSHOT | GETAT id key | RELEASE id");
    println!("          FLUSH | COMPACT [start] [end] | STATS | PROP name | DEMO | EXIT");

    tracing::info!(path = %path.display(), sync, "shell ready");

    let mut shell = Shell {
        db,
        write_opts: WriteOptions { sync },
        snapshots: HashMap::new(),
        next_snapshot: 1,
    };
    prompt();

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if !shell.execute(&line) {
            break;
        }
        prompt();
    }

    shell.close()
}

fn prompt() {
    print!("> ");
    io::stdout().flush().ok();
}

struct Shell {
    db: Db,
    write_opts: WriteOptions,
    snapshots: HashMap<u64, Snapshot>,
    next_snapshot: u64,
}

impl Shell {
    /// Runs one command line. Returns `false` once the session should end.
    fn execute(&mut self, line: &str) -> bool {
        let mut parts = line.split_whitespace();
        let Some(cmd) = parts.next() else {
            return true;
        };
        let args: Vec<&str> = parts.collect();
        tracing::debug!(command = cmd, args = args.len(), "executing");

        let result = match cmd.to_uppercase().as_str() {
            "PUT" | "SET" => self.put(&args),
            "GET" => self.get(&args),
            "DEL" => self.del(&args),
            "BATCH" => self.batch(&args),
            "SCAN" => self.scan(&args, false),
            "RSCAN" => self.scan(&args, true),
            "SNAPSHOT" => self.snapshot(),
            "GETAT" => self.get_at(&args),
            "RELEASE" => self.release(&args),
            "FLUSH" => self.flush(),
            "COMPACT" => self.compact(&args),
            "STATS" => self.stats(),
            "PROP" => self.prop(&args),
            "DEMO" => self.demo(),
            "EXIT" | "QUIT" => return false,
            other => {
                println!("unknown command: {}", other);
                return true;
            }
        };
        if let Err(e) = result {
            println!("ERR {:#}", e);
        }
        true
    }

    fn put(&self, args: &[&str]) -> Result<()> {
        let [key, value @ ..] = args else {
            bail!("usage: PUT key value");
        };
        if value.is_empty() {
            bail!("usage: PUT key value");
        }
        let value = value.join(" ");
        self.db
            .put(&self.write_opts, key.as_bytes(), value.as_bytes())
            .context("put failed")?;
        println!("OK");
        Ok(())
    }

    fn get(&self, args: &[&str]) -> Result<()> {
        let [key] = args else {
            bail!("usage: GET key");
        };
        let value = self
            .db
            .get(&ReadOptions::default(), key.as_bytes())
            .context("read failed")?;
        print_value(value);
        Ok(())
    }

    fn del(&self, args: &[&str]) -> Result<()> {
        let [key] = args else {
            bail!("usage: DEL key");
        };
        self.db
            .delete(&self.write_opts, key.as_bytes())
            .context("del failed")?;
        println!("OK");
        Ok(())
    }

    fn batch(&self, args: &[&str]) -> Result<()> {
        if args.is_empty() {
            bail!("usage: BATCH +key=value -key ...");
        }
        let mut batch = WriteBatch::new();
        for op in args {
            if let Some(put) = op.strip_prefix('+') {
                let Some((key, value)) = put.split_once('=') else {
                    bail!("bad batch op {:?}: expected +key=value", op);
                };
                batch.put(key.as_bytes(), value.as_bytes());
            } else if let Some(key) = op.strip_prefix('-') {
                batch.delete(key.as_bytes());
            } else {
                bail!("bad batch op {:?}: expected +key=value or -key", op);
            }
        }
        let count = batch.len();
        self.db
            .write(&self.write_opts, batch)
            .context("batch failed")?;
        println!("OK ({} ops)", count);
        Ok(())
    }

    fn scan(&self, args: &[&str], reverse: bool) -> Result<()> {
        let start = args.first().map(|s| s.as_bytes()).unwrap_or_default();
        let end = args.get(1).map(|s| s.as_bytes());

        let mut it = self.db.iter(&ReadOptions::default())?;
        let mut rows = Vec::new();
        if reverse {
            match end {
                Some(end) => {
                    it.seek(end);
                    if it.valid() {
                        it.prev();
                    } else {
                        it.seek_to_last();
                    }
                }
                None => it.seek_to_last(),
            }
            while it.valid() && it.key() >= start {
                rows.push((it.key().to_vec(), it.value().to_vec()));
                it.prev();
            }
        } else {
            it.seek(start);
            while it.valid() && end.map_or(true, |end| it.key() < end) {
                rows.push((it.key().to_vec(), it.value().to_vec()));
                it.next();
            }
        }
        it.status().context("scan failed")?;

        if rows.is_empty() {
            println!("(empty)");
        } else {
            for (k, v) in &rows {
                println!(
                    "{} -> {}",
                    String::from_utf8_lossy(k),
                    String::from_utf8_lossy(v)
                );
            }
            println!("({} entries)", rows.len());
        }
        Ok(())
    }

    fn snapshot(&mut self) -> Result<()> {
        let snap = self.db.snapshot();
        let id = self.next_snapshot;
        self.next_snapshot += 1;
        println!("snapshot {} (seq={})", id, snap.sequence());
        self.snapshots.insert(id, snap);
        Ok(())
    }

    fn snapshot_id(&self, arg: &str) -> Result<u64> {
        let id: u64 = arg
            .parse()
            .with_context(|| format!("bad snapshot id {:?}", arg))?;
        if !self.snapshots.contains_key(&id) {
            bail!("no snapshot {}", id);
        }
        Ok(id)
    }

    fn get_at(&self, args: &[&str]) -> Result<()> {
        let [id, key] = args else {
            bail!("usage: GETAT id key");
        };
        let id = self.snapshot_id(id)?;
        let opts = ReadOptions {
            snapshot: self.snapshots.get(&id),
            ..ReadOptions::default()
        };
        let value = self.db.get(&opts, key.as_bytes()).context("read failed")?;
        print_value(value);
        Ok(())
    }

    fn release(&mut self, args: &[&str]) -> Result<()> {
        let [id] = args else {
            bail!("usage: RELEASE id");
        };
        let id = self.snapshot_id(id)?;
        if let Some(snap) = self.snapshots.remove(&id) {
            self.db.release_snapshot(snap);
        }
        println!("OK");
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.db.force_flush().context("flush failed")?;
        println!("OK ({})", self.level_counts());
        Ok(())
    }

    fn compact(&self, args: &[&str]) -> Result<()> {
        let begin = args.first().map(|s| s.as_bytes());
        let end = args.get(1).map(|s| s.as_bytes());
        self.db.compact_range(begin, end).context("compact failed")?;
        println!("OK ({})", self.level_counts());
        Ok(())
    }

    fn stats(&self) -> Result<()> {
        println!("last sequence: {}", self.db.last_sequence());
        println!("live snapshots: {}", self.snapshots.len());
        if let Some(mem) = self.db.property("shoal.approximate-memory-usage") {
            println!("memory usage: {} bytes", mem);
        }
        if let Some(stats) = self.db.property("shoal.stats") {
            print!("{}", stats);
        }
        Ok(())
    }

    fn prop(&self, args: &[&str]) -> Result<()> {
        let [name] = args else {
            bail!("usage: PROP name");
        };
        match self.db.property(name) {
            Some(value) => println!("{}", value.trim_end()),
            None => println!("(unknown property)"),
        }
        Ok(())
    }

    /// Puts, overwrites and deletes a few keys under a throwaway prefix and
    /// checks every answer along the way.
    fn demo(&self) -> Result<()> {
        let opts = ReadOptions::default();
        let check = |key: &[u8], want: Option<&[u8]>| -> Result<()> {
            let got = self.db.get(&opts, key)?;
            if got.as_deref() != want {
                bail!(
                    "demo: {} = {:?}, expected {:?}",
                    String::from_utf8_lossy(key),
                    got.map(|v| String::from_utf8_lossy(&v).into_owned()),
                    want.map(String::from_utf8_lossy)
                );
            }
            Ok(())
        };

        self.db.put(&self.write_opts, b"demo:key1", b"value1")?;
        check(b"demo:key1", Some(b"value1"))?;
        println!("put demo:key1 = value1");

        let mut batch = WriteBatch::new();
        batch.delete(b"demo:key1");
        batch.put(b"demo:key2", b"value2");
        self.db.write(&self.write_opts, batch)?;
        check(b"demo:key1", None)?;
        check(b"demo:key2", Some(b"value2"))?;
        println!("batch: del demo:key1, put demo:key2 = value2");
        self.demo_iterate(&[(&b"demo:key2"[..], &b"value2"[..])])?;

        let snap = self.db.snapshot();
        self.db.put(&self.write_opts, b"demo:key2", b"changed")?;
        let at_snap = ReadOptions {
            snapshot: Some(&snap),
            ..ReadOptions::default()
        };
        let old = self.db.get(&at_snap, b"demo:key2")?;
        if old.as_deref() != Some(&b"value2"[..]) {
            bail!("demo: snapshot read saw a later write");
        }
        println!("snapshot still reads demo:key2 = value2");
        drop(snap);

        self.db.force_flush()?;
        check(b"demo:key2", Some(b"changed"))?;
        println!("after flush demo:key2 = changed");

        let mut batch = WriteBatch::new();
        batch.delete(b"demo:key2");
        self.db.write(&self.write_opts, batch)?;
        self.demo_iterate(&[])?;
        println!("demo OK");
        Ok(())
    }

    /// Walks every `demo:` pair forward and compares it with `want`.
    fn demo_iterate(&self, want: &[(&[u8], &[u8])]) -> Result<()> {
        let mut it = self.db.iter(&ReadOptions::default())?;
        let mut got = Vec::new();
        it.seek(b"demo:");
        while it.valid() && it.key().starts_with(b"demo:") {
            got.push((it.key().to_vec(), it.value().to_vec()));
            it.next();
        }
        it.status().context("demo: iteration failed")?;

        let matches = got.len() == want.len()
            && got.iter().zip(want).all(|((k, v), (wk, wv))| k == wk && v == wv);
        if !matches {
            bail!("demo: iteration returned {} pairs, expected {}", got.len(), want.len());
        }
        for (k, v) in &got {
            println!(
                "iterate: {} -> {}",
                String::from_utf8_lossy(k),
                String::from_utf8_lossy(v)
            );
        }
        println!("iterate: {} pairs", got.len());
        Ok(())
    }

    fn level_counts(&self) -> String {
        (0..Options::default().num_levels)
            .map(|level| format!("L{}={}", level, self.db.num_files_at_level(level)))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn close(self) -> Result<()> {
        let Shell { db, snapshots, .. } = self;
        drop(snapshots);
        db.close().context("close failed")?;
        println!("bye");
        Ok(())
    }
}

fn print_value(value: Option<Vec<u8>>) {
    match value {
        Some(v) => println!("{}", String::from_utf8_lossy(&v)),
        None => println!("(nil)"),
    }
}
