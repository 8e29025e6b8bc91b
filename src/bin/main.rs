use bwprobe::{Config, Prober, ProbeReport, Responder, ResponderMode};
use clap::{Parser, Subcommand};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "bwprobe")]
#[command(about = "Bottleneck bandwidth and latency estimation using UDP packet trains", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run in responder mode
    Server {
        /// Port to listen on
        #[arg(short, long, default_value = "42002")]
        port: u16,

        /// Bind to specific address
        #[arg(short, long)]
        bind: Option<String>,

        /// Echo every probe with its arrival timestamp instead of
        /// collecting per-session reports
        #[arg(short, long)]
        echo: bool,
    },

    /// Run in prober (client) mode
    Client {
        /// Responder address to probe
        server: String,

        /// Port to connect to
        #[arg(short, long, default_value = "42002")]
        port: u16,

        /// Bytes per probe packet
        #[arg(short = 'l', long, default_value = "4000")]
        size: usize,

        /// Probe packets per session
        #[arg(short = 'n', long, default_value = "10")]
        count: u64,

        /// Maximum handshake attempts
        #[arg(short, long, default_value = "3")]
        retries: u32,

        /// Collector read deadline in seconds
        #[arg(short, long, default_value = "3")]
        timeout: u64,

        /// Delay between probe sends in microseconds (0 for none)
        #[arg(short, long, default_value = "1")]
        spacing: u64,

        /// Probe an echo-mode responder (no handshake, per-probe
        /// timestamps, enables latency estimates)
        #[arg(short, long)]
        echo: bool,

        /// Output in JSON format
        #[arg(short = 'J', long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server { port, bind, echo } => {
            let mode = if echo {
                ResponderMode::Echo
            } else {
                ResponderMode::Report
            };
            let mut config = Config::responder(port).with_responder_mode(mode);
            if let Some(bind_addr) = bind {
                config.bind_addr = Some(bind_addr.parse()?);
            }

            let responder = Responder::new(config);
            responder.run().await?;
        }

        Commands::Client {
            server,
            port,
            size,
            count,
            retries,
            timeout,
            spacing,
            echo,
            json,
        } => {
            let mut config = Config::prober(server.clone(), port)
                .with_packet_size(size)
                .with_packet_count(count)
                .with_retries(retries)
                .with_read_timeout(Duration::from_secs(timeout))
                .with_send_spacing(Duration::from_micros(spacing))
                .with_json(json);
            if echo {
                config = config.with_responder_mode(ResponderMode::Echo);
            }

            let prober = Prober::new(config)?;
            let report = prober.run().await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&server, port, &report);
            }
        }
    }

    Ok(())
}

fn print_report(server: &str, port: u16, report: &ProbeReport) {
    println!("\nDestination: {}:{}", server, port);
    println!("Rate sent:");
    println!("\tBW - {:.3} Mbps", report.bandwidth_sent_mbps);
    println!("Bottleneck bandwidth estimate:");
    if report.insufficient && report.bandwidth_received_mbps == 0.0 {
        println!("\tinsufficient data ({} probes matched)", report.probes_matched);
    } else {
        println!("\tBW - {:.3} Mbps", report.bandwidth_received_mbps);
    }
    if let (Some(rtt), Some(latency)) = (report.rtt, report.latency) {
        println!("Time estimates:");
        println!("\tRTT - {:.3} ms", rtt.as_secs_f64() * 1e3);
        println!("\tLatency - {:.3} ms", latency.as_secs_f64() * 1e3);
    }
}
