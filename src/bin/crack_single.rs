use clap::Parser;
use crackhash::coordinator::{part_count_for, validate_request};
use crackhash::error::CrackError;
use crackhash::matcher::{HashMatcher, MatchOutcome, MatchProgress};
use crackhash::partition::{total_words, PartitionRange};
use crossbeam_channel::unbounded;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "crack_single")]
#[command(about = "Recover a word from its digest using every core of this machine", long_about = None)]
struct Cli {
    /// Hex digest to recover (MD5, SHA-256 or SHA-512)
    hash: String,
    /// Longest candidate length to try
    #[arg(short, long, default_value_t = 4)]
    max_length: u32,
    /// Partitions searched in parallel (defaults to available cores)
    #[arg(short, long)]
    parts: Option<u32>,
}

fn main() -> Result<(), CrackError> {
    let cli = Cli::parse();
    let target = validate_request(&cli.hash, cli.max_length)?;
    let cores = thread::available_parallelism().map(|n| n.get() as u32).unwrap_or(1);
    let part_count = part_count_for(cli.parts.unwrap_or(cores), cli.max_length)?;
    println!(
        "[crack_single] {:?} digest, {} candidates up to length {}, {} partitions",
        target.algorithm(),
        total_words(cli.max_length)?,
        cli.max_length,
        part_count
    );

    let cancel = CancellationToken::new();
    let progress = Arc::new(MatchProgress::new());
    let (outcomes, results) = unbounded();
    let started = Instant::now();
    let mut handles = Vec::with_capacity(part_count as usize);
    for part_number in 1..=part_count {
        let range = PartitionRange::compute(cli.max_length, part_count, part_number)?;
        let matcher = HashMatcher::new(target.clone());
        let cancel = cancel.clone();
        let progress = progress.clone();
        let outcomes = outcomes.clone();
        let handle = thread::Builder::new()
            .name(format!("part-{}", part_number))
            .spawn(move || {
                let _ = outcomes.send(matcher.search(&range, &cancel, &progress));
            })?;
        handles.push(handle);
    }
    drop(outcomes);

    let mut found = None;
    for outcome in results.iter() {
        if let MatchOutcome::Found(word) = outcome {
            cancel.cancel();
            found = Some(word);
            break;
        }
    }
    for handle in handles {
        let _ = handle.join();
    }

    let elapsed = started.elapsed();
    match found {
        Some(word) => println!(
            "[crack_single] found {:?} after {} candidates in {:.2?}",
            word,
            progress.checked(),
            elapsed
        ),
        None => println!(
            "[crack_single] no word up to length {} matches ({} candidates in {:.2?})",
            cli.max_length,
            progress.checked(),
            elapsed
        ),
    }
    Ok(())
}
