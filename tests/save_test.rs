//! End-to-end save pipeline: dedup, structuring, rejection, embedding
//! fallback, and transcript ingestion.

mod helpers;

use std::sync::Arc;

use helpers::{engine_with, test_engine, FailingEmbedder, HashEmbedder, StubLlm};
use mnemo::llm::ExtractedMemory;
use mnemo::memory::save::{SaveOutcome, SaveRequest};
use mnemo::memory::search::SearchFilters;
use mnemo::memory::types::MemoryType;

fn pattern_request(content: &str) -> SaveRequest {
    SaveRequest {
        content: content.into(),
        memory_type: MemoryType::Pattern,
        domain: "backend".into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn saving_identical_text_twice_deduplicates() {
    let (engine, conn) = test_engine();

    let first = engine
        .memory_save(pattern_request("use async for db queries"))
        .await
        .unwrap();
    let SaveOutcome::Created { id: first_id, .. } = first else {
        panic!("first save should create, got {first:?}");
    };

    let second = engine
        .memory_save(pattern_request("use async for db queries"))
        .await
        .unwrap();
    let SaveOutcome::Updated { id, similarity } = second else {
        panic!("second save should dedup, got {second:?}");
    };
    assert_eq!(id, first_id);
    assert!(similarity >= 0.95);

    // One record, reinforced once
    let conn = conn.lock().unwrap();
    let (count, access): (i64, i64) = conn
        .query_row(
            "SELECT COUNT(*), MAX(access_count) FROM memories",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(access, 1);
}

#[tokio::test]
async fn dedup_respects_type_and_domain_buckets() {
    let (engine, _conn) = test_engine();

    engine
        .memory_save(pattern_request("use async for db queries"))
        .await
        .unwrap();

    // Same text, different type: a fresh record
    let outcome = engine
        .memory_save(SaveRequest {
            content: "use async for db queries".into(),
            memory_type: MemoryType::Fact,
            domain: "backend".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(matches!(outcome, SaveOutcome::Created { .. }));
}

#[tokio::test]
async fn structurer_reject_is_a_normal_outcome() {
    let (engine, conn) = engine_with(
        Arc::new(HashEmbedder),
        Arc::new(StubLlm {
            reject: Some("one-off command".into()),
            ..Default::default()
        }),
    );

    let outcome = engine
        .memory_save(SaveRequest {
            content: "ls -la /tmp".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    let SaveOutcome::Rejected { reason } = outcome else {
        panic!("expected rejection");
    };
    assert_eq!(reason, "one-off command");

    // Nothing was inserted
    let conn = conn.lock().unwrap();
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn structurized_save_stores_xml_and_vector() {
    let (engine, conn) = test_engine();

    let outcome = engine
        .memory_save(SaveRequest {
            content: "prefer prepared statements".into(),
            memory_type: MemoryType::Pattern,
            domain: "backend".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    let SaveOutcome::Created { id, .. } = outcome else {
        panic!("expected creation");
    };

    let conn = conn.lock().unwrap();
    let structured: Option<String> = conn
        .query_row(
            "SELECT structured FROM memories WHERE id = ?1",
            rusqlite::params![id],
            |row| row.get(0),
        )
        .unwrap();
    let structured = structured.expect("structurizer ran");
    assert!(structured.starts_with("<memory type=\"pattern\""));
    assert!(structured.contains("prefer prepared statements"));

    let vectors: i64 = conn
        .query_row("SELECT COUNT(*) FROM memories_vec WHERE rowid = ?1", rusqlite::params![id], |row| row.get(0))
        .unwrap();
    assert_eq!(vectors, 1);
}

#[tokio::test]
async fn skip_structurize_leaves_structured_empty() {
    let (engine, conn) = test_engine();

    let outcome = engine
        .memory_save(SaveRequest {
            content: "raw note kept verbatim".into(),
            skip_structurize: true,
            ..Default::default()
        })
        .await
        .unwrap();
    let SaveOutcome::Created { id, .. } = outcome else {
        panic!("expected creation");
    };

    let conn = conn.lock().unwrap();
    let structured: Option<String> = conn
        .query_row(
            "SELECT structured FROM memories WHERE id = ?1",
            rusqlite::params![id],
            |row| row.get(0),
        )
        .unwrap();
    assert!(structured.is_none());
}

#[tokio::test]
async fn pre_structured_bypasses_the_structurer() {
    // A rejecting LLM would block the save if it were consulted
    let (engine, conn) = engine_with(
        Arc::new(HashEmbedder),
        Arc::new(StubLlm {
            reject: Some("should never be called".into()),
            ..Default::default()
        }),
    );

    let xml = "<memory type=\"fact\" domain=\"devops\"><what>runbook lives in infra/</what></memory>";
    let outcome = engine
        .memory_save(SaveRequest {
            content: "runbook location".into(),
            memory_type: MemoryType::Fact,
            domain: "devops".into(),
            pre_structured: Some(xml.into()),
            ..Default::default()
        })
        .await
        .unwrap();
    let SaveOutcome::Created { id, .. } = outcome else {
        panic!("expected creation");
    };

    let conn = conn.lock().unwrap();
    let structured: Option<String> = conn
        .query_row(
            "SELECT structured FROM memories WHERE id = ?1",
            rusqlite::params![id],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(structured.as_deref(), Some(xml));
}

#[tokio::test]
async fn embedder_outage_yields_lexical_only_record() {
    let (engine, conn) = engine_with(Arc::new(FailingEmbedder), Arc::new(StubLlm::default()));

    let outcome = engine
        .memory_save(SaveRequest {
            content: "note saved while embedder is down".into(),
            skip_structurize: true,
            ..Default::default()
        })
        .await
        .unwrap();
    let SaveOutcome::Created { id, cluster } = outcome else {
        panic!("expected creation");
    };
    assert!(cluster.is_none());

    {
        let conn = conn.lock().unwrap();
        let vectors: i64 = conn
            .query_row("SELECT COUNT(*) FROM memories_vec", [], |row| row.get(0))
            .unwrap();
        assert_eq!(vectors, 0);
    }

    // Reachable lexically, absent from the dense path
    let results = engine
        .quick_search("embedder down", 5, SearchFilters::default())
        .await
        .unwrap();
    assert!(results.iter().any(|r| r.id == id));
}

#[tokio::test]
async fn save_clamps_confidence_into_band() {
    let (engine, conn) = test_engine();

    let outcome = engine
        .memory_save(SaveRequest {
            content: "overconfident note".into(),
            confidence: 2.0,
            skip_structurize: true,
            ..Default::default()
        })
        .await
        .unwrap();
    let SaveOutcome::Created { id, .. } = outcome else {
        panic!("expected creation");
    };

    let conn = conn.lock().unwrap();
    let confidence: f64 = conn
        .query_row(
            "SELECT confidence FROM memories WHERE id = ?1",
            rusqlite::params![id],
            |row| row.get(0),
        )
        .unwrap();
    assert!((confidence - 0.9).abs() < 1e-9);
}

#[tokio::test]
async fn saved_record_carries_summary_and_keywords() {
    let (engine, conn) = test_engine();

    let filler: Vec<String> = (0..30).map(|i| format!("filler{i:02}")).collect();
    let long_content = format!("backoff backoff retry retry retry {}", filler.join(" "));
    let outcome = engine
        .memory_save(SaveRequest {
            content: long_content.clone(),
            skip_structurize: true,
            ..Default::default()
        })
        .await
        .unwrap();
    let SaveOutcome::Created { id, .. } = outcome else {
        panic!("expected creation");
    };

    let conn = conn.lock().unwrap();
    let (summary, keywords): (String, String) = conn
        .query_row(
            "SELECT summary, keywords FROM memories WHERE id = ?1",
            rusqlite::params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert!(summary.ends_with("..."));
    assert!(summary.chars().count() <= 103);
    let keyword_list: Vec<&str> = keywords.split(',').collect();
    assert_eq!(keyword_list[0], "retry");
    assert_eq!(keyword_list[1], "backoff");
}

#[tokio::test]
async fn empty_content_is_an_error() {
    let (engine, _conn) = test_engine();
    let result = engine
        .memory_save(SaveRequest {
            content: "   ".into(),
            ..Default::default()
        })
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn validate_adjusts_confidence_through_the_engine() {
    let (engine, _conn) = test_engine();

    let outcome = engine
        .memory_save(SaveRequest {
            content: "validated note".into(),
            confidence: 0.6,
            skip_structurize: true,
            ..Default::default()
        })
        .await
        .unwrap();
    let SaveOutcome::Created { id, .. } = outcome else {
        panic!("expected creation");
    };

    assert!((engine.memory_validate(id, false).await.unwrap() - 0.55).abs() < 1e-9);
    assert!((engine.memory_validate(id, true).await.unwrap() - 0.65).abs() < 1e-9);
}

#[tokio::test]
async fn transcript_ingestion_saves_extracted_records() {
    let extracted = vec![
        ExtractedMemory {
            memory_type: MemoryType::Decision,
            domain: "backend".into(),
            confidence: 0.7,
            summary: "switched queue to redis streams".into(),
            structured: "<memory type=\"decision\" domain=\"backend\"><what>switched queue to redis streams</what></memory>".into(),
        },
        ExtractedMemory {
            memory_type: MemoryType::Bug,
            domain: "backend".into(),
            confidence: 0.6,
            summary: "worker leaks file handles on retry".into(),
            structured: "<memory type=\"bug\" domain=\"backend\"><what>worker leaks file handles</what><do>close before retry</do></memory>".into(),
        },
    ];
    let (engine, conn) = engine_with(
        Arc::new(HashEmbedder),
        Arc::new(StubLlm {
            extracted,
            ..Default::default()
        }),
    );

    let outcomes = engine.ingest_transcript("…transcript…").await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, SaveOutcome::Created { .. })));

    let conn = conn.lock().unwrap();
    let sources: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM memories WHERE source = 'compact-analyzer'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(sources, 2);
}
