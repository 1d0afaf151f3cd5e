//! Dispatch-loop scenarios over the in-memory queue and store, with a
//! scripted container runner standing in for docker.

use async_trait::async_trait;
use docker_executor::{ContainerRunner, ExecError, RunConfig};
use job_queue::{MemoryQueue, QueueMode};
use match_client::{Match, MatchError, MatchResolver};
use runner::cache::Cache;
use runner::shutdown;
use runner::worker::{Deps, WorkerOptions};
use runner::{evaluator, scorer, stop_flag};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use trial_store::convert::number_to_decimal;
use trial_store::evaluation::{save_success_evaluation, SuccessEvaluationInput};
use trial_store::score::{save_success_score, SuccessScoreInput};
use trial_store::schema::{Attr, Item, PrimaryKey};
use trial_store::{MemoryStore, Store};

struct ScriptedRunner {
    responses: Mutex<VecDeque<Result<Value, ExecError>>>,
    stdin_seen: Mutex<Vec<Vec<String>>>,
    hang_when_empty: bool,
}

impl ScriptedRunner {
    fn with_responses(responses: Vec<Result<Value, ExecError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            stdin_seen: Mutex::new(Vec::new()),
            hang_when_empty: false,
        })
    }

    fn hanging() -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::new()),
            stdin_seen: Mutex::new(Vec::new()),
            hang_when_empty: true,
        })
    }

    fn runs(&self) -> Vec<Vec<String>> {
        self.stdin_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerRunner for ScriptedRunner {
    async fn run(&self, _config: &RunConfig, stdin: &[String]) -> Result<Value, ExecError> {
        self.stdin_seen.lock().unwrap().push(stdin.to_vec());
        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None if self.hang_when_empty => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            None => Err(ExecError::Parse),
        }
    }
}

struct FixedResolver(HashMap<String, Match>);

#[async_trait]
impl MatchResolver for FixedResolver {
    async fn fetch_match_by_id(&self, match_id: &str) -> Result<Match, MatchError> {
        self.0
            .get(match_id)
            .cloned()
            .ok_or_else(|| MatchError::NotFound(match_id.to_string()))
    }
}

fn sphere_match(match_id: &str) -> Match {
    Match {
        id: match_id.to_string(),
        problem_image: "registry.example.com/problems/sphere:latest".into(),
        problem_environments: BTreeMap::from([("SPHERE_OPTIMA".to_string(), "[[1,1]]".to_string())]),
        indicator_image: "registry.example.com/indicators/hypervolume:latest".into(),
        indicator_environments: BTreeMap::from([("HV_REF_POINT".to_string(), "[1,1]".to_string())]),
    }
}

fn resolver_for(match_id: &str) -> Arc<FixedResolver> {
    Arc::new(FixedResolver(HashMap::from([(
        match_id.to_string(),
        sphere_match(match_id),
    )])))
}

fn deps(
    queue: Arc<MemoryQueue>,
    store: Arc<MemoryStore>,
    matches: Arc<FixedResolver>,
    containers: Arc<ScriptedRunner>,
) -> Deps {
    Deps {
        queue,
        store,
        matches,
        containers,
    }
}

fn options(num: u64) -> WorkerOptions {
    WorkerOptions {
        process_name: "test-worker".into(),
        timeout: 2,
        num: Some(num),
        rm: true,
        command: Vec::new(),
    }
}

async fn seed_solution(store: &MemoryStore, match_id: &str, trial_no: &str, variable: Value) {
    let mut item = Item::new();
    item.insert(
        "ID".into(),
        Attr::S(format!("Solutions#{match_id}#P1")),
    );
    item.insert("Trial".into(), Attr::S(trial_no.to_string()));
    item.insert("TrialNo".into(), Attr::S(trial_no.to_string()));
    item.insert("ResourceType".into(), Attr::S("Solution".into()));
    item.insert("MatchID".into(), Attr::S(match_id.to_string()));
    item.insert("ParticipantID".into(), Attr::S("P1".into()));
    item.insert("CreatedAt".into(), Attr::S("2026-01-01T00:00:00.000Z".into()));
    item.insert("Variable".into(), number_to_decimal(&variable));
    store.put_item(item).await.unwrap();
}

async fn seed_success_trial(store: &MemoryStore, match_id: &str, n: u64, objective: Value, score: Value) {
    save_success_evaluation(
        store,
        &SuccessEvaluationInput {
            match_id: match_id.to_string(),
            participant_id: "P1".into(),
            trial_no: format!("{n:05}"),
            created_at: "2026-01-01T00:00:00.000Z".into(),
            started_at: "2026-01-01T00:00:01.000Z".into(),
            finished_at: "2026-01-01T00:00:02.000Z".into(),
            objective,
            constraint: Value::Null,
            info: json!({}),
            feasible: None,
        },
    )
    .await
    .unwrap();
    save_success_score(
        store,
        &SuccessScoreInput {
            match_id: match_id.to_string(),
            participant_id: "P1".into(),
            trial_no: format!("{n:05}"),
            created_at: "2026-01-01T00:00:00.000Z".into(),
            started_at: "2026-01-01T00:00:01.000Z".into(),
            finished_at: "2026-01-01T00:00:02.000Z".into(),
            score,
        },
    )
    .await
    .unwrap();
}

async fn stored_item(store: &MemoryStore, id: &str, trial: &str) -> Option<Item> {
    store
        .get_item(&PrimaryKey {
            id: id.to_string(),
            trial: trial.to_string(),
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn evaluator_persists_a_single_objective_success() {
    let queue = Arc::new(MemoryQueue::new(QueueMode::Evaluator));
    let store = Arc::new(MemoryStore::new());
    let containers = ScriptedRunner::with_responses(vec![Ok(json!({"objective": 0.0}))]);

    queue.push("M1", "P1", "00001");
    seed_solution(&store, "M1", "00001", json!([1.0, 1.0])).await;

    let deps = deps(queue.clone(), store.clone(), resolver_for("M1"), containers.clone());
    evaluator::run(&options(1), &deps, &CancellationToken::new())
        .await
        .unwrap();

    let item = stored_item(&store, "Evaluations#M1#P1", "Success#00001")
        .await
        .expect("a success evaluation is persisted");
    assert_eq!(item.get("Status"), Some(&Attr::S("Success".into())));
    assert_eq!(item.get("Feasible"), Some(&Attr::Null));
    assert_eq!(item.get("Constraint"), Some(&Attr::Null));
    assert_eq!(
        item.get("Objective"),
        Some(&number_to_decimal(&json!(0.0)))
    );
    assert_eq!(queue.acknowledged(), 1);

    // The solution variable went to the container as one JSON line.
    let runs = containers.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0], vec!["[1,1]\n".to_string()]);
}

#[tokio::test]
async fn evaluator_records_a_container_timeout_as_failed() {
    let queue = Arc::new(MemoryQueue::new(QueueMode::Evaluator));
    let store = Arc::new(MemoryStore::new());
    let containers = ScriptedRunner::with_responses(vec![Err(ExecError::Timeout(2))]);

    queue.push("M1", "P1", "00001");
    seed_solution(&store, "M1", "00001", json!([1.0, 1.0])).await;

    let deps = deps(queue.clone(), store.clone(), resolver_for("M1"), containers);
    evaluator::run(&options(1), &deps, &CancellationToken::new())
        .await
        .unwrap();

    let item = stored_item(&store, "Evaluations#M1#P1", "Failed#00001")
        .await
        .expect("a failed evaluation is persisted");
    assert_eq!(
        item.get("ErrorMessage"),
        Some(&Attr::S("Internal Server Error".into()))
    );
    let admin = item
        .get("AdminErrorMessage")
        .and_then(Attr::as_s)
        .unwrap();
    assert!(admin.contains("timeout"), "admin message: {admin}");
    assert_eq!(queue.acknowledged(), 1);
}

#[tokio::test]
async fn duplicate_deliveries_persist_exactly_one_record() {
    let queue = Arc::new(MemoryQueue::new(QueueMode::Evaluator));
    let store = Arc::new(MemoryStore::new());
    let containers = ScriptedRunner::with_responses(vec![Ok(json!({"objective": 0.0}))]);

    queue.push("M1", "P1", "00001");
    queue.push("M1", "P1", "00001");
    seed_solution(&store, "M1", "00001", json!([1.0, 1.0])).await;

    let deps = deps(queue.clone(), store.clone(), resolver_for("M1"), containers.clone());
    evaluator::run(&options(2), &deps, &CancellationToken::new())
        .await
        .unwrap();

    // Both deliveries acknowledged, one container run, one record.
    assert_eq!(queue.acknowledged(), 2);
    assert_eq!(containers.runs().len(), 1);
    assert_eq!(store.len(), 2); // the solution plus one evaluation
    assert!(stored_item(&store, "Evaluations#M1#P1", "Success#00001")
        .await
        .is_some());
}

#[tokio::test]
async fn scorer_runs_the_indicator_over_current_and_history() {
    let queue = Arc::new(MemoryQueue::new(QueueMode::Scorer));
    let store = Arc::new(MemoryStore::new());
    let containers = ScriptedRunner::with_responses(vec![Ok(json!({"score": 0.81}))]);

    seed_success_trial(&store, "M2", 1, json!([0.5, 0.5]), json!(0.25)).await;
    seed_success_trial(&store, "M2", 2, json!([0.25, 0.25]), json!(0.5625)).await;
    save_success_evaluation(
        store.as_ref(),
        &SuccessEvaluationInput {
            match_id: "M2".into(),
            participant_id: "P1".into(),
            trial_no: "00003".into(),
            created_at: "2026-01-01T00:00:00.000Z".into(),
            started_at: "2026-01-01T00:00:01.000Z".into(),
            finished_at: "2026-01-01T00:00:02.000Z".into(),
            objective: json!([0.1, 0.1]),
            constraint: Value::Null,
            info: json!({}),
            feasible: None,
        },
    )
    .await
    .unwrap();
    queue.push("M2", "P1", "00003");

    let cache_dir = tempfile::tempdir().unwrap();
    let mut cache = Cache::open(cache_dir.path().to_path_buf()).unwrap();

    let deps = deps(queue.clone(), store.clone(), resolver_for("M2"), containers.clone());
    scorer::run(&options(1), &deps, &mut cache, &CancellationToken::new())
        .await
        .unwrap();

    let item = stored_item(&store, "Scores#M2#P1", "Success#00003")
        .await
        .expect("a success score is persisted");
    assert_eq!(item.get("Value"), Some(&number_to_decimal(&json!(0.81))));
    assert_eq!(queue.acknowledged(), 1);

    // The indicator read two lines: the current evaluation, then the history
    // of the two prior trials.
    let runs = containers.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].len(), 2);
    let current: Value = serde_json::from_str(&runs[0][0]).unwrap();
    assert_eq!(current["objective"], json!([0.1, 0.1]));
    let history: Value = serde_json::from_str(&runs[0][1]).unwrap();
    let history = history.as_array().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0]["trial_no"], "00001");
    assert_eq!(history[1]["trial_no"], "00002");

    // The freshly scored trial joined the cache.
    let mut reopened = Cache::open(cache_dir.path().to_path_buf()).unwrap();
    reopened.load("M2#P1").unwrap();
    let cached: Vec<String> = reopened
        .values()
        .unwrap()
        .iter()
        .map(|t| t.trial_no.clone())
        .collect();
    assert_eq!(cached, vec!["00001", "00002", "00003"]);
}

#[tokio::test]
async fn scorer_records_a_missing_score_as_failed() {
    let queue = Arc::new(MemoryQueue::new(QueueMode::Scorer));
    let store = Arc::new(MemoryStore::new());
    let containers = ScriptedRunner::with_responses(vec![Ok(json!({"score": null}))]);

    save_success_evaluation(
        store.as_ref(),
        &SuccessEvaluationInput {
            match_id: "M2".into(),
            participant_id: "P1".into(),
            trial_no: "00001".into(),
            created_at: "2026-01-01T00:00:00.000Z".into(),
            started_at: "2026-01-01T00:00:01.000Z".into(),
            finished_at: "2026-01-01T00:00:02.000Z".into(),
            objective: json!([0.1, 0.1]),
            constraint: Value::Null,
            info: json!({}),
            feasible: None,
        },
    )
    .await
    .unwrap();
    queue.push("M2", "P1", "00001");

    let cache_dir = tempfile::tempdir().unwrap();
    let mut cache = Cache::open(cache_dir.path().to_path_buf()).unwrap();

    let deps = deps(queue.clone(), store.clone(), resolver_for("M2"), containers);
    scorer::run(&options(1), &deps, &mut cache, &CancellationToken::new())
        .await
        .unwrap();

    let item = stored_item(&store, "Scores#M2#P1", "Failed#00001")
        .await
        .expect("a failed score is persisted");
    assert_eq!(
        item.get("ErrorMessage"),
        Some(&Attr::S("Internal Server Error".into()))
    );
    assert_eq!(queue.acknowledged(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn a_stop_flag_mid_wait_persists_a_failure_and_halts() {
    let queue = Arc::new(MemoryQueue::new(QueueMode::Evaluator));
    let store = Arc::new(MemoryStore::new());
    let containers = ScriptedRunner::hanging();

    queue.push("M1", "P1", "00001");
    seed_solution(&store, "M1", "00001", json!([1.0, 1.0])).await;

    let flag_dir = tempfile::tempdir().unwrap();
    let name = flag_dir
        .path()
        .join("worker-under-test")
        .to_string_lossy()
        .into_owned();
    stop_flag::create_flag_file(&name, false).unwrap();

    let cancel = CancellationToken::new();
    stop_flag::spawn_stop_flag_watcher(name.clone(), cancel.clone());

    let deps = deps(queue.clone(), store.clone(), resolver_for("M1"), containers);
    let worker = {
        let options = options(10);
        let cancel = cancel.clone();
        tokio::spawn(async move { evaluator::run(&options, &deps, &cancel).await })
    };

    // Let the worker reach the container wait, then ask it to stop.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    stop_flag::set_stop_flag(&name).unwrap();

    let result = worker.await.unwrap();
    let err = result.unwrap_err();
    assert!(shutdown::is_interrupted(&err));

    let item = stored_item(&store, "Evaluations#M1#P1", "Failed#00001")
        .await
        .expect("the in-flight trial is persisted as failed");
    assert_eq!(
        item.get("ErrorMessage"),
        Some(&Attr::S("Internal Server Error".into()))
    );
    assert_eq!(queue.acknowledged(), 1);

    // The flag was set, so the file may now be cleaned up.
    stop_flag::delete_flag_file(&name).unwrap();
}
