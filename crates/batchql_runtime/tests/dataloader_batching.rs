//! Integration tests for batching, caching and job scheduling.

mod support;

use batchql_runtime::{Dataloader, JobError, LoadError};
use futures::future::{join, join_all};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use support::{
    keys, ByColumn, ColumnArgs, DataObject, Database, FailingSource, KeyedDataObject, LabeledArgs,
    NestedDataObject, SlowArgs, SlowSource,
};

fn names(values: &[serde_json::Value]) -> Vec<String> {
    values
        .iter()
        .map(|value| value["name"].as_str().unwrap_or_default().to_string())
        .collect()
}

/// Test that keys requested by concurrent loads share one fetch per round.
#[tokio::test]
async fn test_batches_keys_by_round() {
    let db = Database::recipes();
    let task_db = db.clone();

    let ingredients = Dataloader::with_dataloading(move |loader| async move {
        let objects = loader.with::<DataObject>(task_db);
        let (ingredients, recipes) = join(
            objects.load_all(keys(&["1", "2"])),
            objects.load_all(keys(&["5", "6"])),
        )
        .await;
        assert_eq!(names(&ingredients?), vec!["Wheat", "Corn"]);

        let lookups = recipes?.into_iter().map(|recipe| {
            let ids: Vec<String> = serde_json::from_value(recipe["ingredient_ids"].clone())
                .unwrap_or_default();
            objects.load_all(ids)
        });
        let mut all = Vec::new();
        for result in join_all(lookups).await {
            all.push(names(&result?));
        }
        Ok::<_, JobError>(all)
    })
    .await
    .unwrap();

    assert_eq!(
        ingredients,
        vec![
            vec!["Wheat", "Corn", "Butter", "Baking Soda"],
            vec!["Corn", "Butter", "Cheese"],
        ]
    );
    assert_eq!(db.fetched(), vec![keys(&["1", "2", "5", "6"]), keys(&["3", "4", "7"])]);
}

/// Test that values come back in request order, with primed keys skipped.
#[tokio::test]
async fn test_load_all_preserves_order() {
    let db = Database::recipes();
    let loader = Dataloader::new();
    let objects = loader.with::<DataObject>(db.clone());
    objects.prime("1".to_string(), json!({"id": "1", "name": "Primed Wheat"}));

    let job = objects.clone();
    let values = loader
        .run_isolated(async move { Ok::<_, JobError>(job.load_all(keys(&["7", "1", "3"])).await?) })
        .await
        .unwrap();

    assert_eq!(names(&values), vec!["Cheese", "Primed Wheat", "Butter"]);
    assert_eq!(db.fetched(), vec![keys(&["7", "3"])]);
}

/// Test that an unawaited request rides along with the next fetch.
#[tokio::test]
async fn test_request_joins_next_fetch() {
    let db = Database::recipes();
    let task_db = db.clone();

    let (first, second) = Dataloader::with_dataloading(move |loader| async move {
        let objects = loader.with::<DataObject>(task_db);
        let request = objects.request("1".to_string());
        assert!(!request.is_resolved());

        let second = objects.load("2".to_string()).await?;
        assert!(request.is_resolved());
        let first = request.load().await?;
        Ok::<_, JobError>((first, second))
    })
    .await
    .unwrap();

    assert_eq!(first["name"], "Wheat");
    assert_eq!(second["name"], "Corn");
    assert_eq!(db.fetched(), vec![keys(&["1", "2"])]);
}

/// Test that a source may load from another source while fetching.
#[tokio::test]
async fn test_nested_sources() {
    let db = Database::recipes();
    let task_db = db.clone();

    let value = Dataloader::with_dataloading(move |loader| async move {
        let nested = loader.with::<NestedDataObject>(task_db);
        Ok::<_, JobError>(nested.load("5".to_string()).await?)
    })
    .await
    .unwrap();

    assert_eq!(value["name"], "Cornbread");
    assert_eq!(
        db.log(),
        vec![("NestedDataObject", keys(&["5"])), ("DataObject", keys(&["5"]))]
    );
}

/// Test that a custom batch key collapses differently-labelled handles.
#[tokio::test]
async fn test_batch_key_for_shares_instances() {
    let db = Database::recipes();
    let loader = Dataloader::new();
    let first = loader.with::<KeyedDataObject>(LabeledArgs {
        label: "first".to_string(),
        db: db.clone(),
    });
    let second = loader.with::<KeyedDataObject>(LabeledArgs {
        label: "second".to_string(),
        db: db.clone(),
    });
    assert!(first.same_instance(&second));
    assert_eq!(second.source().label, "first");

    let values = loader
        .run_isolated(async move {
            let (a, b) = join(first.load("1".to_string()), second.load("2".to_string())).await;
            Ok::<_, JobError>(vec![a?, b?])
        })
        .await
        .unwrap();

    assert_eq!(names(&values), vec!["Wheat", "Corn"]);
    assert_eq!(db.fetched(), vec![keys(&["1", "2"])]);
    assert_eq!(loader.source_count(), 1);
}

/// Test that constructor arguments select separate instances.
#[tokio::test]
async fn test_column_params_batch_separately() {
    let db = Database::recipes();
    let task_db = db.clone();

    let (by_type, by_name) = Dataloader::with_dataloading(move |loader| async move {
        let by_type = loader.with::<ByColumn>(ColumnArgs {
            column: "type".to_string(),
            db: task_db.clone(),
        });
        let by_name = loader.with::<ByColumn>(ColumnArgs {
            column: "name".to_string(),
            db: task_db,
        });
        let (types, named) = join(
            by_type.load_all(keys(&["Grain", "Dairy"])),
            by_name.load("Cheese".to_string()),
        )
        .await;
        Ok::<_, JobError>((types?, named?))
    })
    .await
    .unwrap();

    assert_eq!(names(&by_type[0]), vec!["Wheat", "Corn"]);
    assert_eq!(names(&by_type[1]), vec!["Butter", "Cheese"]);
    assert_eq!(names(&by_name), vec!["Cheese"]);

    let mut fetched = db.fetched();
    fetched.sort();
    assert_eq!(fetched, vec![keys(&["Cheese"]), keys(&["Grain", "Dairy"])]);
}

/// Test that slow sources flushed in the same round run concurrently.
#[tokio::test]
async fn test_slow_sources_flush_in_parallel() {
    let db = Database::recipes();
    let task_db = db.clone();
    let started = Instant::now();

    let values = Dataloader::with_dataloading(move |loader| async move {
        let slow = |name| {
            loader.with::<SlowSource>(SlowArgs {
                name,
                delay_ms: 200,
                db: task_db.clone(),
            })
        };
        let (a, b) = join(
            slow("SlowA").load("1".to_string()),
            slow("SlowB").load("2".to_string()),
        )
        .await;
        Ok::<_, JobError>(vec![a?, b?])
    })
    .await
    .unwrap();

    assert_eq!(names(&values), vec!["Wheat", "Corn"]);
    assert_eq!(db.fetched().len(), 2);
    assert!(started.elapsed() < Duration::from_millis(380));
}

/// Test that a failed batch fails only the keys it contained.
#[tokio::test]
async fn test_fetch_error_is_isolated() {
    let db = Database::recipes();
    let task_db = db.clone();

    let (failed, loaded) = Dataloader::with_dataloading(move |loader| async move {
        let failing = loader.with::<FailingSource>(task_db.clone());
        let objects = loader.with::<DataObject>(task_db);
        Ok::<_, JobError>(join(failing.load("1".to_string()), objects.load("1".to_string())).await)
    })
    .await
    .unwrap();

    let err = failed.unwrap_err();
    assert_eq!(err.to_string(), "Data not found");
    assert_eq!(err.source_name(), "FailingSource");
    assert_eq!(loaded.unwrap()["name"], "Wheat");
}

/// Test that every job waiting on a failed batch sees the failure itself.
///
/// Waiters resume grouped by key, so both loads of "1" come first.
#[tokio::test]
async fn test_fetch_error_reaches_each_waiting_job() {
    let db = Database::recipes();
    let loader = Dataloader::new();
    let outcomes = Arc::new(Mutex::new(Vec::new()));

    for key in ["1", "2", "1"] {
        let failing = loader.with::<FailingSource>(db.clone());
        let outcomes = Arc::clone(&outcomes);
        loader.append_job(async move {
            let err = failing.load(key.to_string()).await.unwrap_err();
            assert!(matches!(err, LoadError::Fetch { source_name: "FailingSource", .. }));
            outcomes.lock().push(format!("{key}: {err}"));
            Ok(())
        });
    }
    let objects = loader.with::<DataObject>(db.clone());
    let found = Arc::clone(&outcomes);
    loader.append_job(async move {
        let value = objects.load("3".to_string()).await?;
        found.lock().push(format!("3: {}", value["name"].as_str().unwrap_or_default()));
        Ok(())
    });

    loader.run().await.unwrap();

    assert_eq!(
        *outcomes.lock(),
        vec![
            "1: Data not found",
            "1: Data not found",
            "2: Data not found",
            "3: Butter",
        ]
    );
    assert_eq!(
        db.log(),
        vec![("FailingSource", keys(&["1", "2"])), ("DataObject", keys(&["3"]))]
    );
}

/// Test that failed keys are not cached.
#[tokio::test]
async fn test_failed_keys_are_refetched() {
    let db = Database::recipes();
    let loader = Dataloader::new();
    let failing = loader.with::<FailingSource>(db.clone());

    for _ in 0..2 {
        let job = failing.clone();
        let result = loader
            .run_isolated(async move { Ok::<_, JobError>(job.load("1".to_string()).await) })
            .await
            .unwrap();
        assert!(result.is_err());
        assert!(!failing.is_cached(&"1".to_string()));
    }
    assert_eq!(
        db.log(),
        vec![("FailingSource", keys(&["1"])), ("FailingSource", keys(&["1"]))]
    );
}

/// Test that a throw stops the run and reaches the caller.
#[tokio::test]
async fn test_throw_propagates_through_run() {
    let loader = Dataloader::new();
    loader.append_job(async { Err(JobError::throw("halt", json!({"at": 1}))) });

    let err = loader.run().await.unwrap_err();
    assert!(err.is_throw());
    assert_eq!(err.into_thrown("halt").unwrap(), json!({"at": 1}));
}

/// Test that other failures let the queue settle before reporting.
#[tokio::test]
async fn test_failure_reported_after_queue_settles() {
    let loader = Dataloader::new();
    let finished = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&finished);

    loader.append_job(async { Err(JobError::message("first")) });
    loader.append_job(async { Err(JobError::message("second")) });
    loader.append_job(async move {
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });

    let err = loader.run().await.unwrap_err();
    assert_eq!(err.to_string(), "first");
    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(loader.stats().jobs_failed, 2);
}

/// Test that an isolated run fetches only its own keys.
#[tokio::test]
async fn test_run_isolated_inside_a_job() {
    let db = Database::recipes();
    let task_db = db.clone();

    let (inner, outer) = Dataloader::with_dataloading(move |loader| async move {
        let objects = loader.with::<DataObject>(task_db);
        let pending = objects.request("1".to_string());

        let isolated = objects.clone();
        let inner = loader
            .run_isolated(async move { Ok::<_, JobError>(isolated.load("2".to_string()).await?) })
            .await?;
        assert!(!pending.is_resolved());

        let outer = pending.load().await?;
        Ok::<_, JobError>((inner, outer))
    })
    .await
    .unwrap();

    assert_eq!(inner["name"], "Corn");
    assert_eq!(outer["name"], "Wheat");
    assert_eq!(db.fetched(), vec![keys(&["2"]), keys(&["1"])]);
}

/// Test that outer jobs running while an isolated run waits keep their
/// appends on the outer queue.
#[tokio::test]
async fn test_outer_appends_skip_a_waiting_isolated_run() {
    let db = Database::recipes();
    let loader = Dataloader::new();
    let events = Arc::new(Mutex::new(Vec::new()));

    let slow = |name, delay_ms| {
        loader.with::<SlowSource>(SlowArgs {
            name,
            delay_ms,
            db: db.clone(),
        })
    };
    let fast = slow("Fast", 100);
    let lagging = slow("Lagging", 300);

    let (isolating, log) = (loader.clone(), Arc::clone(&events));
    loader.append_job(async move {
        isolating
            .run_isolated(async move { Ok::<_, JobError>(fast.load("1".to_string()).await?) })
            .await?;
        log.lock().push("isolated done");
        Ok(())
    });

    let (appending, log) = (loader.clone(), Arc::clone(&events));
    loader.append_job(async move {
        log.lock().push("outer ran");
        let appended = Arc::clone(&log);
        appending.append_job(async move {
            appended.lock().push("appended started");
            lagging.load("2".to_string()).await?;
            appended.lock().push("appended done");
            Ok(())
        });
        Ok(())
    });

    loader.run().await.unwrap();

    assert_eq!(
        *events.lock(),
        vec!["outer ran", "appended started", "isolated done", "appended done"]
    );
}

/// Test the scheduler counters after a two-round load.
#[tokio::test]
async fn test_stats_count_fetches() {
    let db = Database::recipes();
    let loader = Dataloader::new();
    let objects = loader.with::<NestedDataObject>(db);

    let job = objects.clone();
    loader
        .run_isolated(async move { Ok::<_, JobError>(job.load_all(keys(&["1", "2"])).await?) })
        .await
        .unwrap();

    let stats = loader.stats();
    assert_eq!(stats.fetch_calls, 2);
    assert_eq!(stats.keys_fetched, 4);
    assert!(stats.flush_rounds >= 2);
    assert_eq!(stats.jobs_failed, 0);
}
