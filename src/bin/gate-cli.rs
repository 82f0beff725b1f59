use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use reqwest::StatusCode;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "gate-cli")]
#[command(about = "Management and load-test CLI for the admission gate", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:3001")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show active, queued and maximum concurrent requests
    Status,
    /// Fetch the result of a queued request by the id from its acknowledgment
    Poll { request_id: String },
    /// Hammer an endpoint with concurrent workers and report latencies
    Load {
        #[arg(short, long, default_value_t = 10)]
        concurrency: usize,
        #[arg(short, long, default_value_t = 30)]
        duration_secs: u64,
        #[arg(short, long, default_value = "/api/health")]
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Status => {
            let res = client
                .get(format!("{}/api/admin/concurrency-status", cli.url))
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Poll { request_id } => {
            let res = client
                .get(format!("{}/api/queue/{}", cli.url, request_id))
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Load {
            concurrency,
            duration_secs,
            path,
        } => {
            let url = format!("{}{}", cli.url, path);
            println!("Starting load test:");
            println!("- Concurrency: {}", concurrency);
            println!("- Duration:    {}s", duration_secs);
            println!("- Target:      {}", url);

            let report = run_load(
                client,
                url,
                concurrency,
                Duration::from_secs(duration_secs),
            )
            .await;
            report.print();
        }
    }

    Ok(())
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if status.is_client_error() || status.is_server_error() {
        eprintln!("Error: gate returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    if status == StatusCode::ACCEPTED {
        println!("(202 Accepted)");
    }
    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

#[derive(Default)]
struct LoadReport {
    successful: usize,
    queued: usize,
    failed: usize,
    latencies: Vec<Duration>,
    errors: Vec<String>,
    elapsed: Duration,
}

impl LoadReport {
    fn merge(&mut self, other: LoadReport) {
        self.successful += other.successful;
        self.queued += other.queued;
        self.failed += other.failed;
        self.latencies.extend(other.latencies);
        self.errors.extend(other.errors);
    }

    fn total(&self) -> usize {
        self.successful + self.queued + self.failed
    }

    fn print(&self) {
        let total = self.total();
        println!("\n--- Load Test Results ---");
        println!("Total Requests: {}", total);
        println!("Successful:     {}", self.successful);
        println!("Queued (202):   {}", self.queued);
        println!("Failed:         {}", self.failed);
        println!("Duration:       {:?}", self.elapsed);
        if self.elapsed.as_secs_f64() > 0.0 {
            println!("Requests/sec:   {:.2}", total as f64 / self.elapsed.as_secs_f64());
        }

        if let (Some(min), Some(max)) = (self.latencies.iter().min(), self.latencies.iter().max()) {
            let avg = self.latencies.iter().sum::<Duration>() / self.latencies.len() as u32;
            println!("Min Latency:    {:?}", min);
            println!("Avg Latency:    {:?}", avg);
            println!("Max Latency:    {:?}", max);
        }

        if !self.errors.is_empty() {
            println!("First errors:");
            for error in self.errors.iter().take(5) {
                println!("  {}", error);
            }
        }
        println!("-------------------------\n");
    }
}

async fn run_load(
    client: reqwest::Client,
    url: String,
    concurrency: usize,
    duration: Duration,
) -> LoadReport {
    let start = Instant::now();
    let deadline = start + duration;

    let mut workers = Vec::with_capacity(concurrency);
    for _ in 0..concurrency {
        let client = client.clone();
        let url = url.clone();
        workers.push(tokio::spawn(async move {
            let mut report = LoadReport::default();
            while Instant::now() < deadline {
                let req_start = Instant::now();
                match client
                    .get(&url)
                    .timeout(Duration::from_secs(10))
                    .send()
                    .await
                {
                    Ok(res) if res.status() == StatusCode::ACCEPTED => report.queued += 1,
                    Ok(res) if res.status().is_success() => {
                        report.successful += 1;
                        report.latencies.push(req_start.elapsed());
                    }
                    Ok(res) => {
                        report.failed += 1;
                        report.errors.push(format!("status {}", res.status()));
                    }
                    Err(e) => {
                        report.failed += 1;
                        report.errors.push(e.to_string());
                    }
                }
            }
            report
        }));
    }

    let mut report = LoadReport::default();
    for worker in workers {
        match worker.await {
            Ok(partial) => report.merge(partial),
            Err(e) => report.errors.push(format!("worker failed: {}", e)),
        }
    }
    report.elapsed = start.elapsed();
    report
}
