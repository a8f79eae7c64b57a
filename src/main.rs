//! CLI entry point for `mtxbox`.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{CommandFactory, Parser, Subcommand};
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};

use mtxbox::config::Config;
use mtxbox::model::{Body, Encoding, FlagSet, SequenceSet, Structure};
use mtxbox::parser::address::address_list_to_string;
use mtxbox::parser::header::decode_encoded_words;
use mtxbox::parser::mbox::MboxReader;
use mtxbox::store::record::parse_internal_date;
use mtxbox::store::RecordFormat;
use mtxbox::{codec, MailboxStore, OpenOptions};

#[derive(Parser)]
#[command(name = "mtxbox", version, about = "Append-only local mailbox tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Open mailboxes read-only (nothing is written, not even \Seen)
    #[arg(long, global = true)]
    readonly: bool,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new, empty mailbox
    Create { path: PathBuf },
    /// List the messages in a mailbox
    List {
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Print a message, its header, its text or one body part
    Show {
        path: PathBuf,
        msgno: u32,
        /// Only the header block
        #[arg(long, conflicts_with_all = ["text", "section"])]
        header: bool,
        /// Only the text after the header
        #[arg(long, conflicts_with = "section")]
        text: bool,
        /// A body section such as 1 or 2.1
        #[arg(long)]
        section: Option<String>,
        /// Remove the transfer encoding of the section
        #[arg(long, requires = "section")]
        decode: bool,
    },
    /// Print the MIME structure of a message
    Structure {
        path: PathBuf,
        msgno: u32,
        #[arg(long)]
        json: bool,
    },
    /// Search messages, e.g. `UNSEEN FROM alice SINCE 1-Jan-2024`
    Search {
        path: PathBuf,
        #[arg(required = true, num_args = 1..)]
        criteria: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Set or clear flags, e.g. `flag box 1:3 "\Seen $Work"`
    Flag {
        path: PathBuf,
        sequence: String,
        flags: String,
        /// Clear the flags instead of setting them
        #[arg(long)]
        clear: bool,
    },
    /// Permanently remove messages marked \Deleted
    Expunge { path: PathBuf },
    /// Append a message read from a file or stdin
    Append {
        path: PathBuf,
        /// Message file; stdin when omitted
        message: Option<PathBuf>,
        #[arg(long, default_value = "")]
        flags: String,
        /// Internal date, `dd-Mon-yyyy hh:mm:ss +zzzz`
        #[arg(long)]
        date: Option<String>,
    },
    /// Copy messages to another mailbox
    Copy {
        path: PathBuf,
        sequence: String,
        dest: PathBuf,
        /// Mark the originals \Deleted afterwards
        #[arg(long = "move")]
        move_messages: bool,
    },
    /// Import every message of a Unix mbox file
    Import {
        mbox: PathBuf,
        dest: PathBuf,
        /// Create the destination if it does not exist
        #[arg(long)]
        create: bool,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page
    Manpage,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = mtxbox::config::load_config();

    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    setup_logging(log_level, &config);

    let readonly = cli.readonly;
    match cli.command {
        Commands::Create { path } => cmd_create(&path),
        Commands::List { path, json } => cmd_list(&config, &path, readonly, json),
        Commands::Show {
            path,
            msgno,
            header,
            text,
            section,
            decode,
        } => cmd_show(&config, &path, readonly, msgno, header, text, section.as_deref(), decode),
        Commands::Structure { path, msgno, json } => cmd_structure(&config, &path, msgno, json),
        Commands::Search {
            path,
            criteria,
            json,
        } => cmd_search(&config, &path, readonly, &criteria.join(" "), json),
        Commands::Flag {
            path,
            sequence,
            flags,
            clear,
        } => cmd_flag(&config, &path, &sequence, &flags, clear),
        Commands::Expunge { path } => cmd_expunge(&config, &path),
        Commands::Append {
            path,
            message,
            flags,
            date,
        } => cmd_append(&config, &path, message.as_deref(), &flags, date.as_deref()),
        Commands::Copy {
            path,
            sequence,
            dest,
            move_messages,
        } => cmd_copy(&config, &path, &sequence, &dest, move_messages),
        Commands::Import { mbox, dest, create } => cmd_import(&config, &mbox, &dest, create),
        Commands::Completions { shell } => cmd_completions(shell),
        Commands::Manpage => cmd_manpage(),
    }
}

/// Set up tracing with stderr output and optional file logging.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let log_dir = mtxbox::config::cache_dir(config);
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(&log_dir, "mtxbox.log");
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

/// Open a mailbox and load its messages.
fn open_mailbox(config: &Config, path: &Path, readonly: bool) -> anyhow::Result<MailboxStore> {
    let mut store = MailboxStore::open(path, config.open_options(readonly))?;
    store.ping()?;
    Ok(store)
}

fn cmd_create(path: &Path) -> anyhow::Result<()> {
    MailboxStore::create(path)?;
    println!("  Created {}", path.display());
    Ok(())
}

fn cmd_list(config: &Config, path: &Path, readonly: bool, json: bool) -> anyhow::Result<()> {
    let mut store = open_mailbox(config, path, readonly)?;

    let mut rows = Vec::new();
    for msgno in 1..=store.exists_count() {
        let envelope = store.fetch_envelope(msgno)?;
        let entry = store.entry(msgno)?.clone();
        let flags = store.flags(msgno)?;
        rows.push((msgno, entry, flags, envelope));
    }

    if json {
        let items: Vec<serde_json::Value> = rows
            .iter()
            .map(|(msgno, entry, flags, env)| {
                serde_json::json!({
                    "msgno": msgno,
                    "internal_date": entry.internal_date.to_rfc3339(),
                    "size": entry.size,
                    "recent": entry.recent,
                    "flags": flags,
                    "from": address_list_to_string(&env.from),
                    "subject": env.decoded_subject(),
                    "message_id": env.message_id,
                })
            })
            .collect();
        let output = serde_json::json!({
            "mailbox": path.to_string_lossy(),
            "format": store.format().map(RecordFormat::name),
            "exists": store.exists_count(),
            "recent": store.recent_count(),
            "messages": items,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} message(s), {} recent, {}",
        store.exists_count(),
        store.recent_count(),
        format_size(store.watermark(), BINARY)
    );
    println!();
    if rows.is_empty() {
        return Ok(());
    }
    println!(
        "  {:<5} {:<6} {:<17} {:<25} {:<40} {:>8}",
        "#", "Flags", "Date", "From", "Subject", "Size"
    );
    println!("  {}", "-".repeat(106));
    for (msgno, entry, flags, env) in &rows {
        let from = env
            .first_from()
            .map(|a| match &a.personal {
                Some(name) => decode_encoded_words(name),
                None => a.addr_spec(),
            })
            .unwrap_or_default();
        let from_trunc: String = from.chars().take(24).collect();
        let subject = env.decoded_subject().unwrap_or_default();
        let subj_trunc: String = subject.chars().take(39).collect();
        println!(
            "  {:<5} {:<6} {:<17} {:<25} {:<40} {:>8}",
            msgno,
            flag_letters(flags, entry.recent),
            entry.internal_date.format("%Y-%m-%d %H:%M"),
            from_trunc,
            subj_trunc,
            format_size(entry.size, BINARY)
        );
    }
    println!();
    Ok(())
}

/// One letter per flag: Recent, Seen, Answered, Flagged, Deleted, Draft.
fn flag_letters(flags: &FlagSet, recent: bool) -> String {
    use mtxbox::model::SystemFlags;
    let letter = |on: bool, c: char| if on { c } else { '-' };
    [
        letter(recent, 'N'),
        letter(flags.system.contains(SystemFlags::SEEN), 'S'),
        letter(flags.system.contains(SystemFlags::ANSWERED), 'A'),
        letter(flags.system.contains(SystemFlags::FLAGGED), 'F'),
        letter(flags.system.contains(SystemFlags::DELETED), 'D'),
        letter(flags.system.contains(SystemFlags::DRAFT), 'd'),
    ]
    .iter()
    .collect()
}

#[allow(clippy::too_many_arguments)]
fn cmd_show(
    config: &Config,
    path: &Path,
    readonly: bool,
    msgno: u32,
    header: bool,
    text: bool,
    section: Option<&str>,
    decode: bool,
) -> anyhow::Result<()> {
    let mut store = open_mailbox(config, path, readonly)?;
    let bytes = match (header, text, section) {
        (true, _, _) => store.fetch_header(msgno)?,
        (_, true, _) => store.fetch_text(msgno)?,
        (_, _, Some(section)) if decode => store.fetch_body_part_decoded(msgno, section)?,
        (_, _, Some(section)) => store.fetch_body_part(msgno, section)?,
        _ => store.fetch_message(msgno)?,
    };
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&bytes)?;
    stdout.flush()?;
    Ok(())
}

fn cmd_structure(config: &Config, path: &Path, msgno: u32, json: bool) -> anyhow::Result<()> {
    let mut store = open_mailbox(config, path, true)?;
    let body = store.fetch_body(msgno)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        println!();
        print_structure(&body, "1", 1, true);
        println!();
    }
    Ok(())
}

fn print_structure(body: &Body, section: &str, depth: usize, root: bool) {
    let label = if root && !matches!(body.structure, Structure::Single) {
        "-".to_string()
    } else {
        section.to_string()
    };
    let mut line = format!(
        "{}{:<8} {} {}",
        "  ".repeat(depth),
        label,
        body.mime_type(),
        format_size(body.size.bytes, BINARY)
    );
    if body.encoding != Encoding::SevenBit {
        line.push_str(&format!(" [{}]", body.encoding.name()));
    }
    if let Some(name) = body
        .disposition
        .as_ref()
        .and_then(|d| mtxbox::model::body::find_param(&d.params, "filename"))
        .or_else(|| body.param("name"))
    {
        line.push_str(&format!(" \"{name}\""));
    }
    println!("{line}");

    match &body.structure {
        Structure::Single => {}
        Structure::Multipart(parts) => {
            for (i, part) in parts.iter().enumerate() {
                let child = if root {
                    (i + 1).to_string()
                } else {
                    format!("{section}.{}", i + 1)
                };
                print_structure(&part.body, &child, depth + 1, false);
            }
        }
        Structure::Message(Some(nested)) => {
            print_structure(&nested.body, &format!("{section}.1"), depth + 1, false);
        }
        Structure::Message(None) => {}
    }
}

fn cmd_search(
    config: &Config,
    path: &Path,
    readonly: bool,
    criteria: &str,
    json: bool,
) -> anyhow::Result<()> {
    let mut store = open_mailbox(config, path, readonly)?;
    let start = Instant::now();
    let results = store.search(criteria)?;
    let elapsed = start.elapsed();

    if json {
        let output = serde_json::json!({
            "criteria": criteria,
            "result_count": results.len(),
            "results": results,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!();
    println!("  {} result(s) in {:.2?}", results.len(), elapsed);
    println!();
    for msgno in results {
        let env = store.fetch_envelope(msgno)?;
        let subject = env.decoded_subject().unwrap_or_default();
        let subj_trunc: String = subject.chars().take(60).collect();
        println!("  {msgno:<5} {subj_trunc}");
    }
    println!();
    Ok(())
}

fn cmd_flag(
    config: &Config,
    path: &Path,
    sequence: &str,
    flags: &str,
    clear: bool,
) -> anyhow::Result<()> {
    let mut store = open_mailbox(config, path, false)?;
    let sequence = SequenceSet::parse(sequence)?;
    let flags = FlagSet::parse(flags)?;
    if clear {
        store.clear_flags(&sequence, &flags)?;
    } else {
        store.set_flags(&sequence, &flags)?;
    }
    store.check()?;
    Ok(())
}

fn cmd_expunge(config: &Config, path: &Path) -> anyhow::Result<()> {
    let mut store = open_mailbox(config, path, false)?;
    let before = store.watermark();
    let expunged = store.expunge()?;
    println!(
        "  Expunged {} message(s), reclaimed {}",
        expunged.len(),
        format_size(before - store.watermark(), BINARY)
    );
    Ok(())
}

fn cmd_append(
    config: &Config,
    path: &Path,
    message: Option<&Path>,
    flags: &str,
    date: Option<&str>,
) -> anyhow::Result<()> {
    let bytes = match message {
        Some(file) => std::fs::read(file)?,
        None => {
            let mut buf = Vec::new();
            std::io::stdin().lock().read_to_end(&mut buf)?;
            buf
        }
    };
    let flags = FlagSet::parse(flags)?;
    let date = match date {
        Some(text) => Some(
            parse_internal_date(text)
                .ok_or_else(|| anyhow::anyhow!("invalid date '{text}', expected dd-Mon-yyyy hh:mm:ss +zzzz"))?,
        ),
        None => None,
    };
    MailboxStore::append_to(path, &bytes, &flags, date, &config.open_options(false))?;
    println!("  Appended {} to {}", format_size(bytes.len(), BINARY), path.display());
    Ok(())
}

fn cmd_copy(
    config: &Config,
    path: &Path,
    sequence: &str,
    dest: &Path,
    move_messages: bool,
) -> anyhow::Result<()> {
    let mut store = open_mailbox(config, path, !move_messages)?;
    let sequence = SequenceSet::parse(sequence)?;
    let count = if move_messages {
        store.move_to(&sequence, dest)?
    } else {
        store.copy(&sequence, dest)?
    };
    println!(
        "  {} {} message(s) to {}",
        if move_messages { "Moved" } else { "Copied" },
        count,
        dest.display()
    );
    Ok(())
}

/// Import a Unix mbox into a mailbox, one record per message.
fn cmd_import(config: &Config, mbox: &Path, dest: &Path, create: bool) -> anyhow::Result<()> {
    if !mbox.exists() {
        anyhow::bail!("file not found: {}", mbox.display());
    }
    if create && !dest.exists() {
        MailboxStore::create(dest)?;
    }

    let options = config.open_options(false);
    let format = destination_format(dest, &options)?;

    let reader = MboxReader::open(mbox)?;
    let pb = ProgressBar::new(reader.file_size());
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} Importing [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .expect("valid template")
            .progress_chars("#>-"),
    );

    let start = Instant::now();
    let count = reader.read_all(
        &mut |message| {
            let text = match format {
                RecordFormat::Mtx => codec::to_crlf(&message.raw),
                RecordFormat::Tenex => message.raw,
            };
            MailboxStore::append_to(dest, &text, &message.flags, message.delivered, &options)?;
            Ok(true)
        },
        Some(&|current, total| {
            pb.set_length(total);
            pb.set_position(current);
        }),
    )?;
    pb.finish_and_clear();

    println!();
    println!("  {:<20} {}", "Source", mbox.display());
    println!("  {:<20} {}", "Mailbox", dest.display());
    println!("  {:<20} {}", "Messages", count);
    println!(
        "  {:<20} {}",
        "Size",
        format_size(std::fs::metadata(dest)?.len(), BINARY)
    );
    println!("  {:<20} {:.2?}", "Time", start.elapsed());
    println!();
    Ok(())
}

/// The record variant new messages in `dest` will be written in.
fn destination_format(dest: &Path, options: &OpenOptions) -> anyhow::Result<RecordFormat> {
    let store = MailboxStore::open(dest, OpenOptions {
        readonly: true,
        ..options.clone()
    })?;
    Ok(store.format().unwrap_or(options.create_format))
}

/// Generate shell completions and print to stdout.
fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "mtxbox", &mut std::io::stdout());
    Ok(())
}

/// Generate a man page and print to stdout.
fn cmd_manpage() -> anyhow::Result<()> {
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    std::io::Write::write_all(&mut std::io::stdout(), &buf)?;
    Ok(())
}
