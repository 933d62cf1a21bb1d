// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic record-search usage example.
//!
//! Demonstrates:
//! 1. Loading a small corpus into in-memory indexed and bulk stores
//! 2. A fast-path point lookup on an indexed field
//! 3. A paginated substring scan
//! 4. A multi-field OR spanning both stores
//! 5. Narrowing a previous search, and a point read by id
//! 6. Health, stats and the recent-search log
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_search
//! ```

use std::sync::Arc;

use record_search::{Access, CandidateRecord, InMemoryStore, SearchEngine, SearchEngineConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           record-search: Basic Usage Example                  ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Load both stores
    // ─────────────────────────────────────────────────────────────────────────
    let config = SearchEngineConfig::default();
    let indexed = InMemoryStore::indexed(config.indexed_fields.clone()).with_chunk_size(16);
    let bulk = InMemoryStore::bulk().with_chunk_size(16);

    let people: Vec<CandidateRecord> = (1..=60)
        .map(|i| {
            let surname = if i % 3 == 0 { "Singh" } else { "Sharma" };
            CandidateRecord::new(format!("p{:03}", i))
                .with("mobile", format!("98765{:05}", i))
                .with("name", format!("Person{} {}", i, surname))
                .with("circle", if i % 2 == 0 { "Delhi" } else { "Mumbai" })
        })
        .collect();
    indexed.upsert_batch(people.clone())?;
    bulk.upsert_batch(people)?;

    let engine = SearchEngine::new(config, Arc::new(indexed), Arc::new(bulk))?;
    println!("✅ Loaded 60 people into both stores\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Point lookup (indexed store only)
    // ─────────────────────────────────────────────────────────────────────────
    let page = engine
        .search_json(
            Access::Authorized,
            r#"{"query": "9876500042", "fields": ["mobile"], "match_type": "full"}"#,
        )
        .await?;
    println!("🔎 mobile = 9876500042 → {:?} in {}ms", page.ids(), page.execution_time_ms);

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Paginated substring scan (bulk store)
    // ─────────────────────────────────────────────────────────────────────────
    let mut offset = 0;
    loop {
        let body = format!(
            r#"{{"query": "singh", "fields": ["name"], "match_type": "partial", "limit": 8, "offset": {}}}"#,
            offset
        );
        let page = engine.search_json(Access::Authorized, &body).await?;
        println!("📄 offset {:>2}: {:?} (total {})", offset, page.ids(), page.total_count);
        if !page.has_more {
            break;
        }
        offset += 8;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. OR across both stores
    // ─────────────────────────────────────────────────────────────────────────
    let page = engine
        .search_json(
            Access::Authorized,
            r#"{"query": "", "field_queries": {"mobile": "9876500007", "name": "person9 singh"},
                "match_type": "full", "logic": "or"}"#,
        )
        .await?;
    println!("\n🔀 mobile OR name → {:?}\n", page.ids());

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Search within, point read
    // ─────────────────────────────────────────────────────────────────────────
    let singhs = engine
        .search_json(Access::Authorized, r#"{"query": "singh", "fields": ["name"], "limit": 5}"#)
        .await?;
    let body = format!(
        r#"{{"search_id": "{}", "query": "delhi", "fields": ["circle"], "match_type": "full"}}"#,
        singhs.search_id
    );
    let delhi = engine.search_within_json(Access::Authorized, &body).await?;
    println!("🎯 {} Singhs, {} of them in Delhi", singhs.total_count, delhi.total_count);

    if let Some(person) = engine.get_record(Access::Authorized, "p042").await? {
        println!("🪪 p042 → {:?}\n", person.get("name"));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Operational view
    // ─────────────────────────────────────────────────────────────────────────
    println!("🩺 Health: {}", serde_json::to_string(&engine.health().await)?);
    let stats = engine.stats(Access::Authorized).await?;
    println!(
        "📊 Stats: {} records, {:.2}ms average, {} searches in the last 24h",
        stats.total_records, stats.avg_search_time_ms, stats.searches_last_24h
    );
    for entry in engine.recent_searches(3) {
        println!("   {} → {} results ({}ms)", entry.search_id, entry.result_count, entry.execution_time_ms);
    }

    println!("\n👋 Done");
    Ok(())
}
