//! Integration tests for rules applied through the workspace: walker variants,
//! cancellation and removal, observed through event channels.

use sipforge_core::{
    ForgeSettings, MetadataOption, Rule, RuleDefinition, RuleEvent, RuleEventKind, RuleState,
    SchemeNode, SipError, SipWorkspace, WalkerKind,
};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use walkdir::WalkDir;

/// Source tree used by most tests:
///
/// ```text
/// src/a/x.tmp
/// src/a/y.txt
/// src/a/deep/z.txt
/// src/b/c.txt
/// src/loose.txt
/// ```
fn create_source_tree(base: &Path) -> PathBuf {
    let src = base.join("src");
    fs::create_dir_all(src.join("a/deep")).unwrap();
    fs::create_dir_all(src.join("b")).unwrap();
    fs::write(src.join("a/x.tmp"), "tmp").unwrap();
    fs::write(src.join("a/y.txt"), "y").unwrap();
    fs::write(src.join("a/deep/z.txt"), "z").unwrap();
    fs::write(src.join("b/c.txt"), "c").unwrap();
    fs::write(src.join("loose.txt"), "loose").unwrap();
    src
}

fn create_workspace(base: &Path) -> SipWorkspace {
    SipWorkspace::builder(base.join("work"))
        .settings(ForgeSettings {
            ignored_files: "*.tmp".to_string(),
            ..Default::default()
        })
        .progress_interval(Duration::ZERO)
        .build()
        .expect("Failed to build workspace")
}

fn create_rule(ws: &SipWorkspace, roots: Vec<PathBuf>, walker: WalkerKind) -> Arc<Rule> {
    let node = ws.add_node(SchemeNode::new("Fonds", None)).unwrap();
    ws.create_rule(RuleDefinition {
        roots,
        walker,
        metadata: MetadataOption::default(),
        destination: node,
    })
    .unwrap()
}

/// Receive events up to and including the walk's terminal one.
async fn until_terminal(events: &mut UnboundedReceiver<RuleEvent>) -> Vec<RuleEventKind> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("Timed out waiting for rule events")
            .expect("Event channel closed");
        let terminal = event.kind.is_walk_terminal();
        seen.push(event.kind);
        if terminal {
            return seen;
        }
    }
}

/// Files below `roots` that the `*.tmp` ignore rule keeps.
fn expected_files(roots: &[PathBuf]) -> BTreeSet<PathBuf> {
    roots
        .iter()
        .flat_map(|root| WalkDir::new(root).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().map_or(true, |ext| ext != "tmp"))
        .collect()
}

#[tokio::test]
async fn test_single_sip_covers_filtered_selection() {
    let temp = TempDir::new().unwrap();
    let src = create_source_tree(temp.path());
    let ws = create_workspace(temp.path());
    let roots = vec![src.join("a"), src.join("b"), src.join("loose.txt")];
    let rule = create_rule(&ws, roots.clone(), WalkerKind::SingleSip);

    let mut events = rule.subscribe_channel();
    ws.apply_rule(rule.id()).unwrap();
    let seen = until_terminal(&mut events).await;
    assert_eq!(seen.first(), Some(&RuleEventKind::Started));

    let sips = ws.all_description_objects();
    assert_eq!(sips.len(), 1);
    let sip = sips[0].read().unwrap();
    assert_eq!(sip.representations.len(), 3);

    let files = sip.file_paths();
    let unique: BTreeSet<PathBuf> = files.iter().cloned().collect();
    assert_eq!(files.len(), unique.len());
    assert_eq!(unique, expected_files(&roots));
}

#[tokio::test]
async fn test_ignore_rule_example() {
    let temp = TempDir::new().unwrap();
    let src = create_source_tree(temp.path());
    let ws = create_workspace(temp.path());
    let rule = create_rule(
        &ws,
        vec![src.join("a"), src.join("b/c.txt")],
        WalkerKind::SingleSip,
    );

    ws.apply_rule(rule.id()).unwrap();
    assert_eq!(rule.wait(), RuleState::Applied);

    let sip = rule.sips()[0].read().unwrap().clone();
    let paths = sip.full_tree_paths();
    assert!(paths.contains(&src.join("a")));
    assert!(paths.contains(&src.join("b/c.txt")));
    assert!(!paths.contains(&src.join("a/x.tmp")));
}

#[tokio::test]
async fn test_per_file_count_and_cursor() {
    let temp = TempDir::new().unwrap();
    let src = create_source_tree(temp.path());
    let ws = create_workspace(temp.path());
    let rule = create_rule(&ws, vec![src.clone()], WalkerKind::PerFile);

    let mut events = rule.subscribe_channel();
    ws.apply_rule(rule.id()).unwrap();
    let seen = until_terminal(&mut events).await;

    let expected = expected_files(&[src]);
    match seen.last() {
        Some(RuleEventKind::Applied { sip_count, errors }) => {
            assert_eq!(*sip_count, expected.len());
            assert!(errors.is_empty());
        }
        other => panic!("Unexpected terminal event: {:?}", other),
    }

    let mut cursor = rule.cursor();
    assert_eq!(cursor.len(), expected.len());
    let mut seen_paths = Vec::new();
    while cursor.has_next() {
        let sip = cursor.next().unwrap();
        seen_paths.extend(sip.read().unwrap().file_paths());
    }
    assert!(cursor.next().is_none());
    assert_eq!(seen_paths.len(), expected.len());
    assert_eq!(
        seen_paths.iter().cloned().collect::<BTreeSet<_>>(),
        expected
    );

    cursor.reset();
    assert_eq!(cursor.count(), expected.len());
}

#[tokio::test]
async fn test_progress_is_non_decreasing_and_terminal_last() {
    let temp = TempDir::new().unwrap();
    let src = create_source_tree(temp.path());
    let ws = create_workspace(temp.path());
    let rule = create_rule(&ws, vec![src], WalkerKind::PerFile);

    let mut events = rule.subscribe_channel();
    ws.apply_rule(rule.id()).unwrap();
    let seen = until_terminal(&mut events).await;
    rule.wait();

    let visited: Vec<usize> = seen
        .iter()
        .filter_map(|k| match k {
            RuleEventKind::Progress(p) => Some(p.visited),
            _ => None,
        })
        .collect();
    assert!(!visited.is_empty());
    assert!(visited.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(seen.iter().filter(|k| k.is_walk_terminal()).count(), 1);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_per_folder_partitions_selection() {
    let temp = TempDir::new().unwrap();
    let src = create_source_tree(temp.path());
    let ws = create_workspace(temp.path());

    let (max, suggested) = ws.folder_depths(&[src.clone()]);
    assert_eq!(max, 2);
    assert_eq!(suggested, 1);

    let rule = create_rule(&ws, vec![src.clone()], WalkerKind::PerFolder { depth: 1 });
    ws.apply_rule(rule.id()).unwrap();
    assert_eq!(rule.wait(), RuleState::Applied);

    let mut union = BTreeSet::new();
    let mut total = 0;
    let mut sources = Vec::new();
    for sip in rule.sips() {
        let sip = sip.read().unwrap();
        let files = sip.file_paths();
        total += files.len();
        union.extend(files);
        sources.push(sip.source_path.clone().unwrap());
    }
    assert_eq!(total, union.len());
    assert_eq!(union, expected_files(&[src.clone()]));
    assert!(sources.contains(&src.join("a")));
    assert!(sources.contains(&src.join("b")));
}

#[tokio::test]
async fn test_per_folder_rejects_mixed_selection() {
    let temp = TempDir::new().unwrap();
    let src = create_source_tree(temp.path());
    let ws = create_workspace(temp.path());
    let rule = create_rule(
        &ws,
        vec![src.join("a"), src.join("loose.txt")],
        WalkerKind::PerFolder { depth: 0 },
    );

    let mut events = rule.subscribe_channel();
    let result = ws.apply_rule(rule.id());
    assert!(matches!(result, Err(SipError::InvalidSelection { .. })));
    assert_eq!(rule.state(), RuleState::Pending);
    assert!(rule.sips().is_empty());
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_per_folder_depth_out_of_range() {
    let temp = TempDir::new().unwrap();
    let src = create_source_tree(temp.path());
    let ws = create_workspace(temp.path());
    let rule = create_rule(&ws, vec![src], WalkerKind::PerFolder { depth: 7 });

    let result = ws.apply_rule(rule.id());
    assert!(matches!(
        result,
        Err(SipError::DepthOutOfRange {
            requested: 7,
            max: 2
        })
    ));
}

#[tokio::test]
async fn test_cancel_after_progress_ticks_discards_previews() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("many");
    fs::create_dir_all(&src).unwrap();
    for i in 0..50 {
        fs::write(src.join(format!("f{:02}.txt", i)), "x").unwrap();
    }
    let ws = create_workspace(temp.path());
    let rule = create_rule(&ws, vec![src], WalkerKind::PerFile);

    let weak = Arc::downgrade(&rule);
    let ticks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ticks);
    rule.subscribe(move |event| {
        if matches!(event.kind, RuleEventKind::Progress(_))
            && counter.fetch_add(1, Ordering::SeqCst) + 1 == 3
        {
            if let Some(rule) = weak.upgrade() {
                rule.cancel();
            }
        }
    });

    let mut events = rule.subscribe_channel();
    ws.apply_rule(rule.id()).unwrap();
    let seen = until_terminal(&mut events).await;
    assert_eq!(rule.wait(), RuleState::Cancelled);

    assert_eq!(seen.last(), Some(&RuleEventKind::Cancelled));
    assert_eq!(
        seen.iter()
            .filter(|k| matches!(k, RuleEventKind::Cancelled))
            .count(),
        1
    );
    assert!(rule.sips().is_empty());
    assert!(ws.all_description_objects().is_empty());
    assert!(ws.registry().is_empty());
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_remove_during_walk_ends_removed_without_previews() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("many");
    fs::create_dir_all(&src).unwrap();
    for i in 0..200 {
        fs::write(src.join(format!("f{:03}.txt", i)), "x").unwrap();
    }
    let ws = create_workspace(temp.path());
    let rule = create_rule(&ws, vec![src], WalkerKind::PerFile);

    let weak = Arc::downgrade(&rule);
    let remover: Arc<Mutex<Option<JoinHandle<Result<Vec<String>, SipError>>>>> =
        Arc::new(Mutex::new(None));
    let slot = Arc::clone(&remover);
    rule.subscribe(move |event| {
        if !matches!(event.kind, RuleEventKind::Progress(_)) {
            return;
        }
        let mut slot = slot.lock().unwrap();
        if slot.is_none() {
            if let Some(rule) = weak.upgrade() {
                *slot = Some(thread::spawn(move || rule.remove()));
            }
        }
    });

    let mut events = rule.subscribe_channel();
    ws.apply_rule(rule.id()).unwrap();

    let handle = loop {
        if let Some(handle) = remover.lock().unwrap().take() {
            break handle;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    let removed = handle.join().unwrap().unwrap();

    assert!(removed.is_empty());
    assert_eq!(rule.state(), RuleState::Removed);
    assert!(rule.sips().is_empty());
    assert!(ws.registry().is_empty());

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind);
    }
    let removing = kinds
        .iter()
        .position(|k| matches!(k, RuleEventKind::Removing))
        .unwrap();
    assert!(!kinds[removing..]
        .iter()
        .any(|k| matches!(k, RuleEventKind::Applied { .. } | RuleEventKind::Cancelled)));
    assert!(!kinds[removing..]
        .iter()
        .any(|k| matches!(k, RuleEventKind::Progress(_))));
    assert_eq!(kinds.last(), Some(&RuleEventKind::Removed));
}

#[tokio::test]
async fn test_remove_rule_hides_its_previews() {
    let temp = TempDir::new().unwrap();
    let src = create_source_tree(temp.path());
    let ws = create_workspace(temp.path());
    let keep = create_rule(&ws, vec![src.join("b")], WalkerKind::PerFile);
    let drop = create_rule(&ws, vec![src.join("a")], WalkerKind::PerFile);

    ws.apply_rule(keep.id()).unwrap();
    ws.apply_rule(drop.id()).unwrap();
    keep.wait();
    drop.wait();
    assert_eq!(ws.all_description_objects().len(), 3);

    let mut events = drop.subscribe_channel();
    let removed = ws.remove_rule(drop.id()).unwrap();
    assert_eq!(removed.len(), 2);
    assert_eq!(drop.state(), RuleState::Removed);
    assert!(drop
        .sips()
        .iter()
        .all(|s| s.read().unwrap().removed));

    let remaining = ws.all_description_objects();
    assert_eq!(remaining.len(), 1);
    assert_eq!(
        remaining[0].read().unwrap().rule_id.as_deref(),
        Some(keep.id())
    );

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind);
    }
    assert_eq!(kinds.first(), Some(&RuleEventKind::Removing));
    assert!(matches!(kinds[1], RuleEventKind::SipsRemoved { .. }));
    assert_eq!(kinds.last(), Some(&RuleEventKind::Removed));

    assert!(matches!(
        ws.apply_rule(drop.id()),
        Err(SipError::RuleNotFound(_))
    ));
}
