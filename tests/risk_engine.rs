//! Risk engine scenarios against a scripted upstream.

mod common;

use std::sync::Arc;

use chrono::Utc;
use tokenflow::entities::EntityRegistry;
use tokenflow::graph::FlowGraphEngine;
use tokenflow::risk::RiskEngine;
use tokenflow::storage::models::{Entity, EntityKind, FlagSeverity, RiskLevel};
use tokenflow::storage::{MemoryStore, Store};

use common::{transfer, ScriptedUpstream};

const MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

async fn engine_with(
    upstream: ScriptedUpstream,
    tagged: Vec<(&str, EntityKind)>,
) -> (RiskEngine, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    for (address, kind) in tagged {
        store
            .upsert_entity(Entity {
                address: address.to_string(),
                entity_kind: kind,
                name: None,
                risk_level: RiskLevel::Critical,
                risk_score: 100,
                metadata: serde_json::json!({}),
            })
            .await
            .unwrap();
    }

    let store_dyn: Arc<dyn Store> = store.clone();
    let registry = Arc::new(EntityRegistry::new(Arc::clone(&store_dyn)));
    let source = Arc::new(upstream);
    let graph = Arc::new(FlowGraphEngine::new(
        source.clone(),
        Arc::clone(&registry),
        Arc::clone(&store_dyn),
    ));
    let engine = RiskEngine::new(source, registry, graph, store_dyn);
    (engine, store)
}

#[tokio::test]
async fn peel_chain_raises_the_score() {
    let now = Utc::now().timestamp();
    // Ratios 0.92, ~0.924, ~0.918: three consecutive peel hops.
    let upstream = ScriptedUpstream::new()
        .with_transfer(transfer("p1", "X1", "H1", MINT, 1000, now - 400))
        .with_transfer(transfer("p2", "X1", "H2", MINT, 920, now - 300))
        .with_transfer(transfer("p3", "X1", "H3", MINT, 850, now - 200))
        .with_transfer(transfer("p4", "X1", "H4", MINT, 780, now - 100));

    let (engine, store) = engine_with(upstream, vec![]).await;
    let assessment = engine.assess("X1", MINT).await.unwrap();

    assert!(assessment.risk_score >= 35);
    let peel = assessment
        .flags
        .iter()
        .find(|f| f.flag_type == "peel_chain")
        .expect("peel_chain flag");
    assert_eq!(peel.severity, FlagSeverity::Critical);
    assert_eq!(peel.details["chain_length"], 3);

    // The flag history was persisted.
    assert!(store
        .risk_flags_for("X1")
        .await
        .iter()
        .any(|f| f.flag_type == "peel_chain"));
}

#[tokio::test]
async fn direct_sanction_short_circuits_to_100() {
    let upstream = ScriptedUpstream::new();
    let (engine, _store) = engine_with(upstream, vec![("BAD1", EntityKind::Sanctioned)]).await;

    let assessment = engine.assess("BAD1", MINT).await.unwrap();
    assert_eq!(assessment.risk_score, 100);
    assert_eq!(assessment.risk_level, RiskLevel::Critical);
    assert_eq!(assessment.flags.len(), 1);
    assert_eq!(assessment.flags[0].flag_type, "sanctioned_direct");
}

#[tokio::test]
async fn sanctioned_counterparty_within_two_hops() {
    let now = Utc::now().timestamp();
    let upstream = ScriptedUpstream::new()
        .with_transfer(transfer("s1", "X2", "MID2", MINT, 500, now - 300))
        .with_transfer(transfer("s2", "MID2", "BAD2", MINT, 500, now - 200));

    let (engine, _store) = engine_with(upstream, vec![("BAD2", EntityKind::Sanctioned)]).await;
    let assessment = engine.assess("X2", MINT).await.unwrap();

    assert!(assessment.risk_score >= 50);
    assert!(assessment
        .flags
        .iter()
        .any(|f| f.flag_type == "sanctioned_proximity"));
}

#[tokio::test]
async fn mixer_proximity_flags_at_depth_two() {
    let now = Utc::now().timestamp();
    let upstream = ScriptedUpstream::new()
        .with_transfer(transfer("m1", "X3", "MID3", MINT, 500, now - 300))
        .with_transfer(transfer("m2", "MID3", "MIX3", MINT, 500, now - 200));

    let (engine, _store) = engine_with(upstream, vec![("MIX3", EntityKind::Mixer)]).await;
    let assessment = engine.assess("X3", MINT).await.unwrap();

    assert!(assessment.risk_score >= 40);
    let flag = assessment
        .flags
        .iter()
        .find(|f| f.flag_type == "mixer_proximity")
        .expect("mixer flag");
    assert_eq!(flag.severity, FlagSeverity::Critical);
}

#[tokio::test]
async fn mixer_three_hops_away_is_out_of_reach() {
    let now = Utc::now().timestamp();
    let upstream = ScriptedUpstream::new()
        .with_transfer(transfer("m1", "X4", "H1X", MINT, 500, now - 400))
        .with_transfer(transfer("m2", "H1X", "H2X", MINT, 500, now - 300))
        .with_transfer(transfer("m3", "H2X", "MIX4", MINT, 500, now - 200));

    let (engine, _store) = engine_with(upstream, vec![("MIX4", EntityKind::Mixer)]).await;
    let assessment = engine.assess("X4", MINT).await.unwrap();
    assert!(!assessment.flags.iter().any(|f| f.flag_type == "mixer_proximity"));
}

#[tokio::test]
async fn circular_flow_adds_a_warning_flag() {
    let now = Utc::now().timestamp();
    let upstream = ScriptedUpstream::new()
        .with_transfer(transfer("c1", "A10", "B10", MINT, 400, now - 300))
        .with_transfer(transfer("c2", "B10", "C10", MINT, 400, now - 200))
        .with_transfer(transfer("c3", "C10", "A10", MINT, 400, now - 100));

    let (engine, _store) = engine_with(upstream, vec![]).await;
    let assessment = engine.assess("A10", MINT).await.unwrap();

    assert!(assessment.risk_score >= 25);
    let flag = assessment
        .flags
        .iter()
        .find(|f| f.flag_type == "circular_flow")
        .expect("circular_flow flag");
    assert_eq!(flag.severity, FlagSeverity::Warning);
    assert_eq!(
        flag.details["addresses"],
        serde_json::json!(["A10", "B10", "C10", "A10"])
    );
}

#[tokio::test]
async fn high_velocity_is_flagged() {
    let now = Utc::now().timestamp();
    let hour_start = (now / 3600) * 3600;
    let mut upstream = ScriptedUpstream::new();
    for i in 0..120 {
        upstream.push(transfer(
            &format!("v{}", i),
            "X5",
            &format!("OUT{}", i),
            MINT,
            10,
            hour_start + (i % 3600),
        ));
    }

    let (engine, _store) = engine_with(upstream, vec![]).await;
    let assessment = engine.assess("X5", MINT).await.unwrap();

    assert!(assessment
        .flags
        .iter()
        .any(|f| f.flag_type == "high_velocity"));
    assert!(assessment.risk_score >= 20);
}

#[tokio::test]
async fn clean_address_scores_low_and_persists_entity_risk() {
    let now = Utc::now().timestamp();
    let upstream = ScriptedUpstream::new()
        .with_transfer(transfer("ok1", "X6", "Y6", MINT, 100, now - 300));

    let (engine, store) = engine_with(upstream, vec![]).await;
    let assessment = engine.assess("X6", MINT).await.unwrap();

    assert_eq!(assessment.risk_score, 0);
    assert_eq!(assessment.risk_level, RiskLevel::Low);
    assert!(assessment.flags.is_empty());

    // Outcome cached on the entity row.
    let entity = store.get_entity("X6").await.unwrap().expect("entity row");
    assert_eq!(entity.risk_score, 0);
}

#[tokio::test]
async fn score_composition_is_clamped_and_leveled() {
    let now = Utc::now().timestamp();
    // Sanctioned neighbor, mixer neighbor, peel chain and a cycle at once.
    let upstream = ScriptedUpstream::new()
        .with_transfer(transfer("z1", "X7", "BAD7", MINT, 1000, now - 900))
        .with_transfer(transfer("z2", "X7", "MIX7", MINT, 920, now - 800))
        .with_transfer(transfer("z3", "X7", "H7", MINT, 850, now - 700))
        .with_transfer(transfer("z4", "X7", "I7", MINT, 780, now - 600))
        .with_transfer(transfer("z5", "H7", "X7", MINT, 100, now - 500));

    let (engine, _store) = engine_with(
        upstream,
        vec![("BAD7", EntityKind::Sanctioned), ("MIX7", EntityKind::Mixer)],
    )
    .await;
    let assessment = engine.assess("X7", MINT).await.unwrap();

    // 50 + 40 + 35 (+25 for the X7->H7->X7 loop) clamps at 100.
    assert_eq!(assessment.risk_score, 100);
    assert_eq!(assessment.risk_level, RiskLevel::Critical);
    assert!(assessment.flags.len() >= 3);
}
