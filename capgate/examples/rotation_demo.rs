//! Walkthrough: seed the core, rotate tiers, watch deltas, call the
//! gateway.
//!
//! Run with: cargo run --example rotation-demo

use anyhow::Result;
use capgate::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config)?;

    let core = CapGate::builder()
        .config(config)
        .tier(Tier::Basic)
        .hardware_score(30)
        .bridge(BridgeState::Online)
        .build();

    core.subscribe(|event| {
        match event {
            RotationEvent::TierChange { previous, current } => {
                println!("tier: {previous} -> {current}");
            }
            RotationEvent::Rotate { delta, .. } => {
                for id in &delta.added {
                    println!("  + {id}");
                }
                for id in &delta.removed {
                    println!("  - {id}");
                }
            }
        }
        Ok(())
    });

    println!("== starting at basic, score 30, bridge online");
    for (scope, features) in core.features(None) {
        println!("{scope}: {}", features.join(", "));
    }

    println!("== upgrade to pro");
    core.update(StateUpdate::none().tier(Tier::Pro));

    println!("== seal a HuggingFace token, then recompute");
    core.vault().seal("HF_TOKEN", "hf_demo_token");
    core.update(StateUpdate::none());

    println!("== upgrade to dev with a capable device");
    core.update(StateUpdate::none().tier(Tier::Dev).hardware_score(80));

    println!("== register an endpoint and call it");
    let id = core.gateway().register_endpoint(
        "httpbin",
        "https://httpbin.org",
        EndpointSpec::new().timeout_ms(10_000),
    )?;
    match core.gateway().request(id, "/json", RequestOptions::new()).await {
        Ok(response) => println!(
            "status {} cached={} latency={}ms",
            response.status, response.cached, response.latency_ms
        ),
        Err(err) => println!("request failed: {err}"),
    }

    let status = core.gateway().rate_status(id)?;
    println!(
        "rate window: {}/{} used, resets in {}ms",
        status.used, status.limit, status.reset_in_ms
    );

    shutdown_tracing();
    Ok(())
}
