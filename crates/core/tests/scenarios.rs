use async_trait::async_trait;
use kbvault_core::embeddings::embed_one;
use kbvault_core::governor::ResourceSample;
use kbvault_core::stores::MANIFEST_FILE;
use kbvault_core::{
    FailureKind, FollowUpOptions, HashingEmbedder, IndexError, IngestError, IngestOptions,
    IngestOutcome, KbVaultConfig, KnowledgeBase, KnowledgeService, ModelRegistry, NoProgress,
    OcrEngine, RetrievalHit, RetrievalOptions, ScriptedSampler, TesseractEngine,
};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use std::collections::HashSet;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

type TestResult = Result<(), Box<dyn Error>>;

struct Fixture {
    dir: TempDir,
    service: KnowledgeService,
}

impl Fixture {
    fn new() -> Result<Self, Box<dyn Error>> {
        Self::with(|_| {}, Arc::new(ScriptedSampler::constant(2, 10.0, 10.0)), Arc::new(TesseractEngine::default()))
    }

    fn with(
        tweak: impl FnOnce(&mut KbVaultConfig),
        sampler: Arc<ScriptedSampler>,
        ocr: Arc<dyn OcrEngine>,
    ) -> Result<Self, Box<dyn Error>> {
        let dir = tempdir()?;
        let mut config = KbVaultConfig::default();
        config.storage.root = dir.path().join("kbs");
        config.embedder.model_name = "E".to_string();
        config.embedder.dim = 384;
        tweak(&mut config);
        let service = KnowledgeService::with_components(config, Arc::new(ModelRegistry::new()), sampler, ocr, None)?;
        Ok(Self { dir, service })
    }

    fn write(&self, name: &str, contents: impl AsRef<[u8]>) -> Result<PathBuf, Box<dyn Error>> {
        let path = self.dir.path().join("sources").join(name);
        std::fs::create_dir_all(path.parent().ok_or("no parent")?)?;
        std::fs::write(&path, contents)?;
        Ok(path)
    }

    fn manifest_path(&self, slug: &str) -> PathBuf {
        self.dir.path().join("kbs").join(slug).join(MANIFEST_FILE)
    }

    async fn ingest(&self, slug: &str, paths: Vec<PathBuf>, options: IngestOptions) -> Result<kbvault_core::IngestReport, IndexError> {
        Ok(self
            .service
            .ingest(slug, paths, options, Arc::new(NoProgress))
            .await?
            .wait()
            .await)
    }
}

fn sources(hits: &[RetrievalHit]) -> Vec<&str> {
    hits.iter().map(|hit| hit.source_name.as_str()).collect()
}

#[tokio::test]
async fn create_and_ingest_one_text_file() -> TestResult {
    let fixture = Fixture::new()?;
    fixture.service.create_kb("kb1").await?;
    let greeting = fixture.write("greeting.txt", "Hello, world.\n")?;

    let report = fixture.ingest("kb1", vec![greeting], IngestOptions::default()).await?;
    assert_eq!(report.outcome, IngestOutcome::Done);

    let kb = fixture.service.open_kb("kb1").await?;
    let snapshot = kb.snapshot();
    let manifest = snapshot.index().manifest();
    assert_eq!(manifest.file_count, 1);
    assert_eq!(manifest.total_size, 14);
    assert_eq!(snapshot.index().chunk_count(), 1);

    let (chunk_id, entry) = snapshot.index().entries().next().ok_or("no chunk")?;
    assert_eq!(entry.text, "Hello, world.");

    let query = embed_one(kb.embedder().as_ref(), "hello")?;
    let hits = snapshot.index().dense_search(&query, 1)?;
    assert_eq!(hits.len(), 1);
    assert_eq!(&hits[0].0, chunk_id);
    Ok(())
}

#[tokio::test]
async fn reingesting_identical_bytes_only_touches_the_record() -> TestResult {
    let fixture = Fixture::new()?;
    fixture.service.create_kb("kb1").await?;
    let greeting = fixture.write("greeting.txt", "Hello, world.\n")?;

    fixture.ingest("kb1", vec![greeting.clone()], IngestOptions::default()).await?;
    let kb = fixture.service.open_kb("kb1").await?;
    let vectors_before = kb.snapshot().index().chunk_count();

    tokio::time::sleep(Duration::from_millis(5)).await;
    let report = fixture.ingest("kb1", vec![greeting], IngestOptions::default()).await?;
    assert!(report.is_done());
    assert_eq!(report.unchanged, vec!["greeting.txt".to_string()]);

    let snapshot = kb.snapshot();
    assert_eq!(snapshot.index().manifest().file_count, 1);
    assert_eq!(snapshot.index().chunk_count(), vectors_before);
    let record = snapshot.metadata().get_file("greeting.txt").ok_or("record missing")?;
    assert!(record.updated_at > record.added_at);
    Ok(())
}

#[tokio::test]
async fn opening_with_another_dimension_is_refused() -> TestResult {
    let fixture = Fixture::new()?;
    fixture.service.create_kb("kb1").await?;
    let greeting = fixture.write("greeting.txt", "Hello, world.\n")?;
    fixture.ingest("kb1", vec![greeting], IngestOptions::default()).await?;

    let manifest_before = std::fs::read(fixture.manifest_path("kb1"))?;
    let dir = fixture.dir.path().join("kbs").join("kb1");
    let result = KnowledgeBase::open(&dir, "kb1", Arc::new(HashingEmbedder::new("E", 768)));

    assert!(matches!(
        result,
        Err(IndexError::ModelIncompatible { expected_dim: 768, found_dim: 384, .. })
    ));
    assert_eq!(std::fs::read(fixture.manifest_path("kb1"))?, manifest_before);
    Ok(())
}

/// Recognizes every page slowly so the resource monitor gets ahead of it.
struct SlowOcr;

#[async_trait]
impl OcrEngine for SlowOcr {
    fn name(&self) -> &str {
        "slow"
    }

    async fn recognize(&self, _png_path: &Path, _languages: &str, _psm: u8) -> Result<String, IngestError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok("scanned page text".to_string())
    }
}

fn image_only_pdf(pages: usize) -> Result<Vec<u8>, Box<dyn Error>> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let image_id = doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => 8,
            "Height" => 8,
            "ColorSpace" => "DeviceGray",
            "BitsPerComponent" => 8,
        },
        vec![180u8; 64],
    ));

    let mut kids: Vec<Object> = Vec::new();
    for _ in 0..pages {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Tj", vec![Object::string_literal(" ")]),
                Operation::new("ET", vec![]),
                Operation::new("Do", vec!["Im1".into()]),
            ],
        };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode()?));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => dictionary! {
                "Font" => dictionary! { "F1" => font_id },
                "XObject" => dictionary! { "Im1" => image_id },
            },
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes)?;
    Ok(bytes)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn emergency_stop_during_ocr_leaves_manifest_untouched() -> TestResult {
    let cool = ResourceSample {
        cpu_percent: 10.0,
        memory_percent: 20.0,
    };
    let saturated = ResourceSample {
        cpu_percent: 99.0,
        memory_percent: 20.0,
    };
    // One planning sample, ten calm monitor samples, then saturation forever.
    let script = std::iter::repeat(cool).take(11).chain(std::iter::once(saturated));
    let sampler = Arc::new(ScriptedSampler::new(1, script));

    let fixture = Fixture::with(
        |config| {
            config.governor.max_cpu_percent = 50.0;
            config.governor.sample_interval_ms = 5;
            config.governor.throttle_pause_ms = 5;
        },
        sampler,
        Arc::new(SlowOcr),
    )?;
    fixture.service.create_kb("kb1").await?;
    let scan = fixture.write("scan.pdf", image_only_pdf(100)?)?;
    let manifest_before = std::fs::read(fixture.manifest_path("kb1"))?;

    let options = IngestOptions {
        use_ocr: true,
        ..IngestOptions::default()
    };
    let report = fixture.ingest("kb1", vec![scan], options).await?;

    assert_eq!(report.outcome, IngestOutcome::Failed(FailureKind::Resource));
    assert!(report.indexed.is_empty());
    assert_eq!(std::fs::read(fixture.manifest_path("kb1"))?, manifest_before);

    let kb = fixture.service.open_kb("kb1").await?;
    assert_eq!(kb.snapshot().index().manifest().file_count, 0);
    assert_eq!(kb.snapshot().index().chunk_count(), 0);
    Ok(())
}

#[tokio::test]
async fn hybrid_retrieval_is_stable() -> TestResult {
    let fixture = Fixture::new()?;
    fixture.service.create_kb("kb1").await?;
    let files = vec![
        fixture.write("a.txt", "the quick brown fox")?,
        fixture.write("b.txt", "brown fox jumps")?,
        fixture.write("c.txt", "unrelated text")?,
    ];
    let report = fixture.ingest("kb1", files, IngestOptions::default()).await?;
    assert_eq!(report.chunks_added, 3);

    let fox_files: HashSet<&str> = ["a.txt", "b.txt"].into_iter().collect();
    let options = RetrievalOptions::default();

    let dense = fixture.service.query("kb1", "fox", &options).await?;
    assert!(fox_files.contains(dense[0].source_name.as_str()));
    let again = fixture.service.query("kb1", "fox", &options).await?;
    assert_eq!(sources(&dense), sources(&again));

    let hybrid_options = RetrievalOptions {
        enable_bm25: true,
        ..RetrievalOptions::default()
    };
    let hybrid = fixture.service.query("kb1", "fox", &hybrid_options).await?;
    assert_eq!(hybrid.len(), 3);
    let leading: HashSet<&str> = sources(&hybrid)[..2].iter().copied().collect();
    assert_eq!(leading, fox_files);
    assert_eq!(hybrid[2].source_name, "c.txt");

    let reranked_options = RetrievalOptions {
        enable_rerank: true,
        ..hybrid_options
    };
    let first = fixture.service.query("kb1", "fox", &reranked_options).await?;
    assert!(fox_files.contains(first[0].source_name.as_str()));
    assert!(first[0].rerank_score.is_some());
    for _ in 0..3 {
        let repeat = fixture.service.query("kb1", "fox", &reranked_options).await?;
        assert_eq!(sources(&repeat), sources(&first));
    }
    Ok(())
}

#[tokio::test]
async fn empty_knowledge_base_answers_with_nothing() -> TestResult {
    let fixture = Fixture::new()?;
    fixture.service.create_kb("empty").await?;
    let options = RetrievalOptions {
        enable_bm25: true,
        enable_rerank: true,
        ..RetrievalOptions::default()
    };
    assert!(fixture.service.query("empty", "anything", &options).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn remove_then_readd_restores_chunk_ids() -> TestResult {
    let fixture = Fixture::new()?;
    fixture.service.create_kb("kb1").await?;
    let text = "Pumps move fluid. ".repeat(120);
    let manual = fixture.write("manual.txt", text)?;

    fixture.ingest("kb1", vec![manual.clone()], IngestOptions::default()).await?;
    let before = fixture.service.list_files("kb1").await?[0].chunk_ids.clone();
    assert!(before.len() > 1);

    fixture.service.remove_file("kb1", "manual.txt").await?;
    assert!(fixture.service.list_files("kb1").await?.is_empty());
    assert!(matches!(
        fixture.service.remove_file("kb1", "manual.txt").await,
        Err(IndexError::FileMissing(_))
    ));

    fixture.ingest("kb1", vec![manual], IngestOptions::default()).await?;
    let after = fixture.service.list_files("kb1").await?[0].chunk_ids.clone();
    assert_eq!(before, after);
    Ok(())
}

#[tokio::test]
async fn follow_up_falls_back_without_llm() -> TestResult {
    let fixture = Fixture::new()?;
    fixture.service.create_kb("kb1").await?;
    let existing = "如何安装Python".to_string();
    let options = FollowUpOptions {
        num_questions: 3,
        existing_questions: vec![existing.clone()],
        ..FollowUpOptions::default()
    };

    let questions = fixture
        .service
        .follow_up("kb1", "……本文介绍安装Python的方法，以及环境变量的配置……", &options)
        .await;

    assert_eq!(questions.len(), 3);
    let known = kbvault_core::analysis::token_set(&existing);
    let mut distinct = HashSet::new();
    for question in &questions {
        assert!(!question.is_empty());
        assert!(question.chars().count() <= 30);
        assert!(kbvault_core::analysis::jaccard(&known, &kbvault_core::analysis::token_set(question)) <= 0.7);
        assert!(distinct.insert(question.clone()));
    }
    Ok(())
}
