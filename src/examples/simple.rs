//! Simple example of using proxy-link-validator as a library.
//!
//! Runs against an external engine when one is found, otherwise against the mock
//! dialer so the example works anywhere.

use proxy_link_validator::dialer::engine::locate_engine;
use proxy_link_validator::{
    Dialer, EngineConfig, EngineDialer, FixedProbe, HttpProbe, MemorySink, MockBehavior, MockDialer,
    Probe, RunSummary, Scheduler, ValidatorConfig,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let links = vec![
        "vmess://eyJhZGQiOiIxLjIuMy40IiwicG9ydCI6NDQzLCJpZCI6IjAwMDAwMDAwLTAwMDAtMDAwMC0wMDAwLTAwMDAwMDAwMDAwMCJ9"
            .to_string(),
        "trojan://password@example.com:443?sni=example.com".to_string(),
        "vless://00000000-0000-0000-0000-000000000000@example.org:8443?security=tls&type=ws&path=%2Fws"
            .to_string(),
        "not-a-link".to_string(),
    ];

    let config = ValidatorConfig::builder()
        .concurrency(2)
        .task_timeout(Duration::from_secs(8))
        .max_latency(Duration::from_secs(3))
        .probe_url("https://www.gstatic.com/generate_204")
        .build();

    let (dialer, probe): (Arc<dyn Dialer>, Arc<dyn Probe>) = match locate_engine() {
        Some(engine) => {
            println!("Using engine {}", engine.display());
            (
                Arc::new(EngineDialer::new(EngineConfig::new(engine))),
                Arc::new(HttpProbe::from_config(&config)?),
            )
        }
        None => {
            println!("No engine found, using the mock dialer");
            (
                Arc::new(MockDialer::new(MockBehavior::ready())),
                Arc::new(FixedProbe::latency(120.0)),
            )
        }
    };

    let scheduler = Scheduler::new(config, dialer, probe);
    let sink = MemorySink::new();
    let records = scheduler.run(&links, &sink).await?;

    for record in &records {
        match (&record.failure_reason, record.latency_ms) {
            (None, Some(latency)) => println!("OK   {:>6.0}ms {}", latency, record.link),
            (Some(reason), _) => println!("FAIL {} ({})", record.link, reason),
            (None, None) => println!("?    {}", record.link),
        }
    }

    let summary = RunSummary::from_records(&records, 3);
    println!("{}/{} usable", summary.succeeded, summary.total);
    Ok(())
}
