//! End-to-end pipeline tests over injected in-memory adapters and
//! deterministic provider doubles.

use std::sync::Arc;

use serde_json::json;
use viking_agfs::{LsOptions, MemoryBackend};
use viking_ai::{FakeSummarizer, HashEmbedder, Summarizer};
use viking_core::{EngineConfig, ErrorCode, VikingUri};
use viking_engine::{
    AddResourceOptions, ContextEngine, EngineComponents, FindOptions, JobStatus, MessageRole,
    QueueStore, SemanticJobRecord,
};
use viking_vector::{LocalVectorStore, Modality, VectorRecord, VectorSource, VectorStore};

struct Harness {
    engine: ContextEngine,
    summarizer: Arc<FakeSummarizer>,
    vector: Arc<LocalVectorStore>,
    tempdir: tempfile::TempDir,
}

/// Routes engine tracing through the test writer; `RUST_LOG` controls the
/// filter when a failing pipeline needs inspecting.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::WARN.into())
        .from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_test_writer()
        .compact()
        .try_init();
}

async fn start(
    summarizer: FakeSummarizer,
    tweak: impl FnOnce(&mut EngineConfig),
) -> Harness {
    init_tracing();
    let tempdir = tempfile::tempdir().expect("tempdir");
    let mut config = EngineConfig::default();
    config.workspace_root = tempdir.path().to_path_buf();
    tweak(&mut config);

    let summarizer = Arc::new(summarizer);
    let vector = Arc::new(LocalVectorStore::open(config.vectors_root()).expect("vector store"));
    let engine = ContextEngine::start_with(
        config,
        EngineComponents {
            agfs_backend: Arc::new(MemoryBackend::new()),
            vector: Arc::clone(&vector) as Arc<dyn VectorStore>,
            summarizer: Arc::clone(&summarizer) as Arc<dyn Summarizer>,
            embedder: Arc::new(HashEmbedder::new(64)),
        },
    )
    .await
    .expect("engine");
    Harness {
        engine,
        summarizer,
        vector,
        tempdir,
    }
}

fn uri(raw: &str) -> VikingUri {
    VikingUri::parse(raw).expect("uri")
}

fn section(word: &str, count: usize) -> String {
    std::iter::repeat(word).take(count).collect::<Vec<_>>().join(" ")
}

fn find_options(limit: usize, threshold: Option<f32>) -> FindOptions {
    FindOptions {
        target_uri: None,
        limit,
        score_threshold: threshold,
        context: None,
    }
}

#[tokio::test]
async fn resource_ingest_builds_semantic_tree_and_routes_queries() {
    let harness = start(FakeSummarizer::new(), |_| {}).await;
    let doc_path = harness.tempdir.path().join("doc.md");
    std::fs::write(
        &doc_path,
        format!(
            "# A\n{}\n\n# B\n{}\n\n# C\n{}",
            section("alfa", 600),
            section("bravo", 600),
            section("charlie", 600),
        ),
    )
    .expect("write doc");

    let outcome = harness
        .engine
        .add_resource(
            doc_path.to_str().expect("utf8 path"),
            &AddResourceOptions {
                reason: Some("ingest test corpus".to_string()),
                wait: true,
                trace: true,
            },
        )
        .await
        .expect("add_resource");
    assert_eq!(outcome.target_uri.as_str(), "viking://resources/doc");

    let trace = outcome.trace.expect("trace requested");
    assert_eq!(trace["schema_version"], "v1");
    assert_eq!(trace["summary"]["operation"], "resource.add");
    assert_eq!(trace["summary"]["status"], "ok");

    // The document split into its three sections.
    let children = harness
        .engine
        .ls(&outcome.target_uri, LsOptions::default())
        .await
        .expect("ls");
    let names: Vec<&str> = children
        .iter()
        .filter_map(|entry| entry.uri.name())
        .collect();
    assert_eq!(names, vec!["A.md", "B.md", "C.md"]);

    // Queues drained; the abstract exists and respects the word budget.
    let counts = harness.engine.wait(30.0).await.expect("wait");
    assert!(counts.drained(), "queues should drain: {counts:?}");
    assert_eq!(counts.errors, 0, "no failed jobs expected");
    let abstract_text = harness
        .engine
        .abstract_of(&outcome.target_uri)
        .await
        .expect("abstract");
    assert!(!abstract_text.trim().is_empty());
    assert!(abstract_text.split_whitespace().count() <= 200);
    let overview = harness
        .engine
        .overview_of(&outcome.target_uri)
        .await
        .expect("overview");
    assert!(overview.contains("B.md"));

    // One vector per artefact plus one per raw leaf.
    assert_eq!(
        harness
            .vector
            .count_prefix(&outcome.target_uri)
            .await
            .expect("count"),
        5
    );

    // A section query surfaces the document within the top three.
    let found = harness
        .engine
        .find("bravo", &find_options(5, Some(0.0)), false)
        .await
        .expect("find");
    assert!(!found.results.is_empty());
    let top3: Vec<&str> = found
        .results
        .iter()
        .take(3)
        .map(|result| result.uri.as_str())
        .collect();
    assert!(
        top3.contains(&"viking://resources/doc"),
        "expected the document in the top 3, got {top3:?}"
    );
}

#[tokio::test]
async fn bottom_up_ordering_is_observable_mid_flight() {
    let harness = start(FakeSummarizer::new().with_delay_ms(25), |_| {}).await;
    let doc_path = harness.tempdir.path().join("doc.md");
    std::fs::write(
        &doc_path,
        format!(
            "# A\n## A1\n{}\n\n## A2\n{}\n\n## A3\n{}\n\n# B\n{}",
            section("alfa", 600),
            section("beta", 600),
            section("gamma", 600),
            section("delta", 600),
        ),
    )
    .expect("write doc");

    let outcome = harness
        .engine
        .add_resource(
            doc_path.to_str().expect("utf8 path"),
            &AddResourceOptions::default(),
        )
        .await
        .expect("add_resource");
    let parent = outcome.target_uri.clone();
    let child = parent.join("A").expect("child uri");

    // At no observable moment may the parent carry artefacts while its child
    // directory does not.
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(30);
    loop {
        let parent_done = harness.engine.abstract_of(&parent).await.is_ok();
        let child_done = harness.engine.abstract_of(&child).await.is_ok();
        assert!(
            !(parent_done && !child_done),
            "parent finished before its child directory"
        );
        if parent_done {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "pipeline did not finish in time"
        );
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let counts = harness.engine.wait(30.0).await.expect("wait");
    assert!(counts.drained());
    assert!(harness.engine.abstract_of(&child).await.is_ok());
}

#[tokio::test]
async fn session_commit_is_idempotent_and_memories_are_retrievable() {
    let harness = start(
        FakeSummarizer::new().with_responses(["facts: User lives in Berlin.".to_string()]),
        |_| {},
    )
    .await;

    let id = harness.engine.session_create().await.expect("create");
    harness
        .engine
        .session_add_message(&id, MessageRole::User, "I live in Berlin.")
        .await
        .expect("append");

    let (first, _) = harness
        .engine
        .session_commit(&id, false)
        .await
        .expect("first commit");
    assert_eq!(first.extracted, 1);
    let target = first.target_uri.clone().expect("memory target");
    assert!(target.as_str().starts_with("viking://user/memories/"));

    // The second commit replays the recorded result, byte for byte.
    let (second, _) = harness
        .engine
        .session_commit(&id, false)
        .await
        .expect("second commit");
    assert_eq!(second.target_uri, first.target_uri);
    assert_eq!(second.extracted, first.extracted);

    // Committed sessions are immutable.
    let error = harness
        .engine
        .session_add_message(&id, MessageRole::User, "too late")
        .await
        .expect_err("sealed");
    assert_eq!(error.code, ErrorCode::InvalidArgument);

    let counts = harness.engine.wait(30.0).await.expect("wait");
    assert!(counts.drained());

    let found = harness
        .engine
        .find(
            "where does the user live",
            &find_options(5, Some(0.0)),
            false,
        )
        .await
        .expect("find");
    let top = found.results.first().expect("at least one result");
    assert!(
        top.uri.starts_with(&target),
        "top result {} should sit under {}",
        top.uri,
        target
    );
}

#[tokio::test]
async fn ast_mode_skips_llm_for_large_code_and_falls_back_below_the_line_floor() {
    let harness = start(FakeSummarizer::new(), |_| {}).await;

    let mut big = String::from("\"\"\"Inventory reconciliation helpers.\"\"\"\nimport os\n\n");
    big.push_str("class Reconciler:\n    def run(self, batch):\n        return batch\n\n");
    big.push_str("def main():\n    return 0\n");
    while big.lines().count() < 120 {
        big.push_str("# padding line to stay realistic\n");
    }
    let big_path = harness.tempdir.path().join("tool.py");
    std::fs::write(&big_path, &big).expect("write tool.py");

    let small = "import sys\n\ndef tiny():\n    return 1\n";
    let small_path = harness.tempdir.path().join("small.py");
    std::fs::write(&small_path, small).expect("write small.py");

    let big_outcome = harness
        .engine
        .add_resource(
            big_path.to_str().expect("utf8"),
            &AddResourceOptions {
                wait: true,
                ..AddResourceOptions::default()
            },
        )
        .await
        .expect("ingest tool.py");
    harness
        .engine
        .add_resource(
            small_path.to_str().expect("utf8"),
            &AddResourceOptions {
                wait: true,
                ..AddResourceOptions::default()
            },
        )
        .await
        .expect("ingest small.py");

    let prompts = harness.summarizer.prompts();
    assert!(
        !prompts
            .iter()
            .any(|prompt| prompt.contains("Summarise the file 'tool.py'")),
        "large code files must use the skeleton, not the LLM"
    );
    assert!(
        prompts
            .iter()
            .any(|prompt| prompt.contains("Summarise the file 'small.py'")),
        "short code files fall back to LLM summarisation"
    );

    // The cached summary for the large file is its structural skeleton.
    let sidecar = harness
        .engine
        .read(
            &big_outcome
                .target_uri
                .join(".file_summaries.json")
                .expect("uri"),
            None,
            None,
        )
        .await
        .expect("sidecar");
    let summaries: std::collections::BTreeMap<String, String> =
        serde_json::from_slice(&sidecar).expect("sidecar json");
    let skeleton = summaries.get("tool.py").expect("tool.py summary");
    assert!(skeleton.contains("import os"));
    assert!(skeleton.contains("class Reconciler:"));
    assert!(skeleton.contains("def main():"));
    assert!(!skeleton.contains("padding line"));
}

#[tokio::test]
async fn identical_memory_facts_collapse_in_search_results() {
    let harness = start(FakeSummarizer::new(), |_| {}).await;
    for (index, text) in [
        "User prefers vim.",
        "User  prefers   VIM.",
        "user prefers vim.",
    ]
    .iter()
    .enumerate()
    {
        let record_uri = uri(&format!(
            "viking://user/memories/session-{index}/preferences/pref-{index}.md"
        ));
        harness
            .vector
            .upsert(VectorRecord {
                uri: record_uri,
                source: VectorSource::Abstract,
                modality: Modality::Text,
                vector: viking_ai::embed_text_vector("user prefers vim", 64),
                payload: json!({
                    "text": text,
                    "source": "abstract",
                    "category": "preferences",
                }),
                updated_at: 1,
            })
            .await
            .expect("upsert");
    }

    let found = harness
        .engine
        .find(
            "user prefers which editor",
            &find_options(5, Some(0.0)),
            false,
        )
        .await
        .expect("find");
    let vim_results: Vec<_> = found
        .results
        .iter()
        .filter(|result| {
            viking_engine::normalise_for_dedup(&result.abstract_text) == "user prefers vim."
        })
        .collect();
    assert_eq!(
        vim_results.len(),
        1,
        "identical facts must collapse: {:?}",
        found.results
    );
    assert!(vim_results[0].hotness.is_some());
}

#[tokio::test]
async fn expired_leases_recover_after_a_crash() {
    let agfs = viking_agfs::Agfs::new(Arc::new(MemoryBackend::new()));
    agfs.init_scope_roots().await.expect("init");
    let dir = uri("viking://.system/queues/semantic");

    {
        let store: QueueStore<SemanticJobRecord> =
            QueueStore::open(agfs.clone(), dir.clone()).await.expect("open");
        store
            .enqueue(SemanticJobRecord::new(
                uri("viking://resources/doc"),
                viking_core::ScopeKind::Resource,
                None,
            ))
            .await
            .expect("enqueue");
        let claimed = store.claim_next(40, |_| true).await.expect("claim");
        assert!(claimed.is_some());
        // The worker "crashes" here: the store is dropped with the job still
        // in progress and its lease ticking.
    }

    tokio::time::sleep(std::time::Duration::from_millis(60)).await;
    let store: QueueStore<SemanticJobRecord> =
        QueueStore::open(agfs, dir).await.expect("reopen");
    assert_eq!(store.counts().in_progress, 1, "state survived the crash");
    let recovered = store.recover_expired_leases().await.expect("recover");
    assert_eq!(recovered, 1);

    let reclaimed = store.claim_next(60_000, |_| true).await.expect("reclaim");
    let reclaimed = reclaimed.expect("job is claimable again");
    assert_eq!(reclaimed.status, JobStatus::InProgress);
}

#[tokio::test]
async fn remove_cascades_across_agfs_vectors_and_queues() {
    let harness = start(FakeSummarizer::new(), |_| {}).await;
    let doc_path = harness.tempdir.path().join("doc.md");
    std::fs::write(&doc_path, format!("# Only\n{}", section("echo", 600))).expect("write");

    let outcome = harness
        .engine
        .add_resource(
            doc_path.to_str().expect("utf8"),
            &AddResourceOptions {
                wait: true,
                ..AddResourceOptions::default()
            },
        )
        .await
        .expect("ingest");
    let target = outcome.target_uri;
    assert!(
        harness
            .vector
            .count_prefix(&target)
            .await
            .expect("count before")
            > 0
    );

    harness.engine.remove(&target, true).await.expect("remove");
    assert!(!harness.engine.stat(&target).await.expect("stat").exists);
    assert_eq!(
        harness
            .vector
            .count_prefix(&target)
            .await
            .expect("count after"),
        0
    );

    let probe = harness.engine.abstract_of(&target).await.expect_err("gone");
    assert_eq!(probe.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn system_surface_reports_liveness_readiness_and_rejects_binaries() {
    let harness = start(FakeSummarizer::new(), |_| {}).await;
    assert_eq!(harness.engine.health()["status"], "ok");

    let ready = harness.engine.ready().await;
    assert_eq!(ready.status, "ok", "checks: {:?}", ready.checks);
    assert_eq!(ready.checks.get("agfs").map(String::as_str), Some("ok"));
    assert_eq!(ready.checks.get("vector").map(String::as_str), Some("ok"));

    let blob_path = harness.tempdir.path().join("blob.bin");
    std::fs::write(&blob_path, [0x7fu8, 0x45, 0x4c, 0x46, 0x00, 0x01]).expect("write blob");
    let error = harness
        .engine
        .add_resource(
            blob_path.to_str().expect("utf8"),
            &AddResourceOptions::default(),
        )
        .await
        .expect_err("unsupported");
    assert_eq!(error.code, ErrorCode::UnsupportedFormat);
}

#[tokio::test]
async fn skills_land_in_the_agent_scope_and_are_greppable() {
    let harness = start(FakeSummarizer::new(), |_| {}).await;
    let target = harness
        .engine
        .add_skill("code-review", "Always check error paths first.")
        .await
        .expect("add skill");
    assert!(target.as_str().starts_with("viking://agent/skills/"));
    harness.engine.wait(30.0).await.expect("wait");

    let matches = harness
        .engine
        .grep("error paths", Some(&target), false)
        .await
        .expect("grep");
    assert_eq!(matches.len(), 1);

    let globbed = harness
        .engine
        .glob("**/*.md", &uri("viking://agent/skills"))
        .await
        .expect("glob");
    assert!(!globbed.is_empty());
}
