use anyhow::{anyhow, Context, Result};
use serde::Serialize;

use switchboard_core::runtime::{sled_len, BranchSled, BufferRegion, CodeRegion, Fallback, Route, SledState};

use crate::{parse_number_pair, parse_u64};

/// Inputs of `switchboard sled-sim`.
#[derive(Debug, Clone, Default)]
pub struct SledSimOptions {
    pub base: u64,
    pub capacity: usize,
    /// Fallback resolver address; `None` builds a trapping sled.
    pub resolver: Option<u64>,
    /// `id=target` pairs, learned in order.
    pub learn: Vec<String>,
    /// `handler:min:max` ranges.
    pub handlers: Vec<String>,
    pub routes: Vec<String>,
    pub dump: bool,
    pub json: bool,
}

#[derive(Debug, Serialize)]
pub struct RouteInfo {
    pub id: u64,
    /// `target`, `fallback` or `trap`.
    pub route: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct SledSimOutcome {
    pub base: u64,
    pub capacity: usize,
    pub entries: usize,
    /// Entries still reachable after any wrap.
    pub live: usize,
    pub wrapped: bool,
    pub state: String,
    pub routes: Vec<RouteInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub words: Vec<String>,
}

/// Build a branch sled in a scratch buffer, fill it and walk it for each
/// queried identifier.
pub fn sled_sim_command(options: &SledSimOptions) -> Result<()> {
    let region = BufferRegion::zeroed(options.base, sled_len(options.capacity));
    let fallback = options.resolver.map_or(Fallback::Trap, Fallback::Resolver);
    let mut sled = BranchSled::new(region, options.capacity, fallback).context("Failed to lay out sled")?;

    for range in &options.handlers {
        let (handler, min, max) = parse_handler(range)?;
        sled.register_handler(handler, min, max)
            .with_context(|| format!("Failed to register handler {range}"))?;
    }
    for pair in &options.learn {
        let (id, target) = parse_number_pair(pair)?;
        sled.learn(id, target).with_context(|| format!("Failed to learn {pair}"))?;
    }

    let mut routes = Vec::new();
    for text in &options.routes {
        let id = parse_u64(text)?;
        let info = match sled.route(id).with_context(|| format!("Failed to route {text}"))? {
            Route::Target(target) => RouteInfo { id, route: "target".to_string(), target: Some(target) },
            Route::Fallback => RouteInfo { id, route: "fallback".to_string(), target: None },
            Route::Trap => RouteInfo { id, route: "trap".to_string(), target: None },
        };
        routes.push(info);
    }

    let words = if options.dump {
        (0..=options.capacity)
            .filter_map(|i| sled.region().read_word(i).map(|w| format!("{:#x}: {w:08x}", options.base + i as u64 * 4)))
            .collect()
    } else {
        Vec::new()
    };
    let state = match sled.state() {
        SledState::Empty => "empty",
        SledState::Partial => "partial",
        SledState::Full => "full",
    };
    let outcome = SledSimOutcome {
        base: options.base,
        capacity: options.capacity,
        entries: sled.entries(),
        live: sled.live_entries(),
        wrapped: sled.has_wrapped(),
        state: state.to_string(),
        routes,
        words,
    };

    if options.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    println!(
        "Sled at {:#x}: {} words, {} entries ({})",
        outcome.base, outcome.capacity, outcome.entries, outcome.state
    );
    if outcome.wrapped {
        println!("Wrapped; {} entries reachable", outcome.live);
    }
    for info in &outcome.routes {
        match info.target {
            Some(target) => println!("- {} -> {target:#x}", info.id),
            None => println!("- {} -> {}", info.id, info.route),
        }
    }
    for line in &outcome.words {
        println!("{line}");
    }
    Ok(())
}

fn parse_handler(text: &str) -> Result<(u64, u64, u64)> {
    let parts: Vec<&str> = text.split(':').collect();
    match parts.as_slice() {
        [handler, min, max] => Ok((parse_u64(handler)?, parse_u64(min)?, parse_u64(max)?)),
        _ => Err(anyhow!("Expected HANDLER:MIN:MAX, got '{text}'")),
    }
}
