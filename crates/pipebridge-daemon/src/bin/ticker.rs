//! Demo child process for `pipebridge`.
//!
//! Prints the current time at random intervals of up to five seconds and
//! echoes every stdin line back on stdout. Prints `eof` and exits when stdin
//! closes.

use std::time::Duration;

use clap::Parser;
use rand::RngExt;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use pipebridge_core::message::trim_line_ending;

/// Upper bound of the pause between two ticks, in seconds.
const MAX_TICK_SECS: f64 = 5.0;

#[derive(Parser, Debug)]
#[command(name = "pipebridge-ticker")]
#[command(version, about = "Timestamp ticker and line echo for pipebridge demos")]
struct Args {
    /// Also echo each input line to stderr, prefixed with "echo: ".
    #[arg(long)]
    stderr: bool,
}

fn next_delay() -> Duration {
    Duration::from_secs_f64(rand::rng().random_range(0.0..MAX_TICK_SECS))
}

async fn emit<W: AsyncWrite + Unpin>(out: &mut W, line: &[u8]) -> std::io::Result<()> {
    out.write_all(line).await?;
    out.write_all(b"\n").await?;
    out.flush().await
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let mut stdin = BufReader::new(tokio::io::stdin());
    // Survives cancelled reads: `read_until` appends what it got so far.
    let mut line = Vec::new();

    let tick = tokio::time::sleep(next_delay());
    tokio::pin!(tick);

    loop {
        tokio::select! {
            () = &mut tick => {
                let now = chrono::Local::now().to_rfc3339();
                emit(&mut stdout, now.as_bytes()).await?;
                tick.as_mut().reset(tokio::time::Instant::now() + next_delay());
            }
            read = stdin.read_until(b'\n', &mut line) => {
                if read? == 0 && line.is_empty() {
                    emit(&mut stdout, b"eof").await?;
                    return Ok(());
                }
                trim_line_ending(&mut line);
                emit(&mut stdout, &line).await?;
                if args.stderr {
                    let echoed = [b"echo: ".as_slice(), &line].concat();
                    emit(&mut stderr, &echoed).await?;
                }
                line.clear();
            }
        }
    }
}
