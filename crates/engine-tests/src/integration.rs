#[cfg(test)]
mod tests {
    use crate::{
        Harness, fast_process_config, target_config,
        utils::{
            order_ids, order_row, order_status, orders, seed_orders, wait_for_ids, wait_for_status,
            wait_until,
        },
    };
    use engine_config::settings::job::MigrationJobSpec;
    use engine_runtime::error::JobError;
    use model::{
        core::value::Value,
        job::{
            algorithm::AlgorithmConfig, config::check_job_id, datasource::DatabaseKind,
            progress::JobItemProgress, status::JobStatus,
        },
        pagination::position::Position,
    };
    use tracing_test::traced_test;

    // Scenario: A single-shard job copies a table, then keeps replicating
    // inserts, updates and deletes made on the source.
    // Expected Outcome:
    // - The target table is created and holds every source row.
    // - Changes made after the inventory show up on the target.
    #[traced_test]
    #[tokio::test]
    async fn inventory_then_incremental() {
        let harness = Harness::new().await;
        harness.register_sources(&["ds_0"]).await;
        let source = harness.factory.memory().database("ds_0").await;
        let target = harness.factory.memory().database("target").await;
        seed_orders(&source, 1..=25).await;

        let spec = MigrationJobSpec::new(["ds_0.orders"], target_config());
        let job_id = harness.api.create_and_start(&spec).await.unwrap();
        wait_for_status(&harness.api, &job_id, JobStatus::RunningIncremental).await;

        let expected: Vec<i64> = (1..=25).collect();
        assert_eq!(order_ids(&target).await, expected);
        let progress = harness.api.get_progress(&job_id).await.unwrap();
        assert_eq!(progress[&0].processed_records, 25);
        assert_eq!(progress[&0].inventory_finished_percentage(), 100);

        source.insert(&orders(), order_row(26, "new")).await.unwrap();
        source.update(&orders(), order_row(3, "shipped")).await.unwrap();
        source.delete(&orders(), &Value::Int(5)).await.unwrap();

        let expected: Vec<i64> = (1..=26).filter(|id| *id != 5).collect();
        wait_for_ids(&target, &expected).await;
        let target_db = &*target;
        wait_until("update of order 3", move || async move {
            order_status(target_db, 3).await.as_deref() == Some("shipped")
        })
        .await;
        let api = &harness.api;
        let job = &job_id;
        wait_until("three change events counted", move || async move {
            api.get_progress(job).await.unwrap()[&0].processed_records == 28
        })
        .await;

        harness.api.stop(&job_id).await.unwrap();
        let progress = harness.api.get_progress(&job_id).await.unwrap();
        assert_eq!(progress[&0].status, JobStatus::Stopped);
        assert!(progress[&0].incremental.is_some());
    }

    // Scenario: A row is inserted past the table's last key while the
    // throttled inventory is still copying.
    // Expected Outcome:
    // - The inventory stops at the key bound read when the job prepared.
    // - The new row arrives once, through the change stream, so processed
    //   records equal the seeded rows plus one change event.
    #[traced_test]
    #[tokio::test]
    async fn rows_inserted_during_inventory_are_counted_once() {
        let config = fast_process_config()
            .with_read_rate_limiter(AlgorithmConfig::new("QPS").with_prop("qps", 5));
        let harness = Harness::with_config(config).await;
        harness.register_sources(&["ds_0"]).await;
        let source = harness.factory.memory().database("ds_0").await;
        let target = harness.factory.memory().database("target").await;
        seed_orders(&source, 1..=25).await;

        let job_id = harness
            .api
            .create_and_start(&MigrationJobSpec::new(["ds_0.orders"], target_config()))
            .await
            .unwrap();
        wait_for_status(&harness.api, &job_id, JobStatus::RunningInventory).await;
        source.insert(&orders(), order_row(26, "new")).await.unwrap();

        wait_for_status(&harness.api, &job_id, JobStatus::RunningIncremental).await;
        let expected: Vec<i64> = (1..=26).collect();
        wait_for_ids(&target, &expected).await;
        let api = &harness.api;
        let job = &job_id;
        wait_until("tail row counted", move || async move {
            api.get_progress(job).await.unwrap()[&0].processed_records >= 26
        })
        .await;

        harness.api.stop(&job_id).await.unwrap();
        let progress = harness.api.get_progress(&job_id).await.unwrap();
        assert_eq!(progress[&0].processed_records, 26);
        assert_eq!(
            progress[&0].inventory.values().next(),
            Some(&Position::Finished)
        );
    }

    // Scenario: The same migration is submitted twice and started again
    // while it runs.
    // Expected Outcome: Both submissions yield the same job id and only one
    // runner per shard exists.
    #[traced_test]
    #[tokio::test]
    async fn resubmitting_a_job_is_idempotent() {
        let harness = Harness::new().await;
        harness.register_sources(&["ds_0"]).await;
        seed_orders(&*harness.factory.memory().database("ds_0").await, 1..=5).await;

        let spec = MigrationJobSpec::new(["ds_0.orders"], target_config());
        let first = harness.api.create_and_start(&spec).await.unwrap();
        let second = harness.api.create_and_start(&spec).await.unwrap();
        harness.api.start(&first).await.unwrap();
        assert_eq!(first, second);

        let jobs = harness.api.list_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].active);
        assert_eq!(jobs[0].target_table, "orders");

        let controller = harness.api.controller(&first).await.unwrap();
        assert_eq!(controller.running_shards().await, vec![0]);
        harness.api.shutdown().await;
    }

    // Scenario: A job is committed after it caught up with the source.
    // Expected Outcome:
    // - The target keeps its table and rows.
    // - Job state and change capture slots are gone.
    #[traced_test]
    #[tokio::test]
    async fn commit_keeps_target_data() {
        let harness = Harness::new().await;
        harness.register_sources(&["ds_0"]).await;
        let source = harness.factory.memory().database("ds_0").await;
        let target = harness.factory.memory().database("target").await;
        seed_orders(&source, 1..=12).await;

        let job_id = harness
            .api
            .create_and_start(&MigrationJobSpec::new(["ds_0.orders"], target_config()))
            .await
            .unwrap();
        wait_for_status(&harness.api, &job_id, JobStatus::RunningIncremental).await;
        harness.api.commit(&job_id).await.unwrap();

        assert_eq!(order_ids(&target).await.len(), 12);
        assert!(target.ddl_log().await.iter().all(|ddl| !ddl.is_drop()));
        assert!(source.slots().await.is_empty());
        assert!(harness.api.list_jobs().await.unwrap().is_empty());
        assert!(matches!(
            harness.api.get_progress(&job_id).await,
            Err(JobError::JobNotFound(_))
        ));
    }

    // Scenario: A running job is rolled back.
    // Expected Outcome: The target table is dropped, the source slot is
    // released and the job is forgotten.
    #[traced_test]
    #[tokio::test]
    async fn rollback_drops_target_table() {
        let harness = Harness::new().await;
        harness.register_sources(&["ds_0"]).await;
        let source = harness.factory.memory().database("ds_0").await;
        let target = harness.factory.memory().database("target").await;
        seed_orders(&source, 1..=12).await;

        let job_id = harness
            .api
            .create_and_start(&MigrationJobSpec::new(["ds_0.orders"], target_config()))
            .await
            .unwrap();
        wait_for_status(&harness.api, &job_id, JobStatus::RunningIncremental).await;
        harness.api.rollback(&job_id).await.unwrap();

        assert!(!target.has_table(&orders()).await);
        assert!(target.ddl_log().await.iter().any(|ddl| ddl.is_drop()));
        assert!(source.slots().await.is_empty());
        assert!(harness.api.controller(&job_id).await.is_none());
        assert!(harness.api.list_jobs().await.unwrap().is_empty());
    }

    // Scenario: A job is rolled back right after it was submitted, while
    // its shards may still be preparing.
    // Expected Outcome: No table, slot or job state is left behind.
    #[traced_test]
    #[tokio::test]
    async fn rollback_while_preparing_leaves_nothing_behind() {
        let harness = Harness::new().await;
        harness.register_sources(&["ds_0"]).await;
        let source = harness.factory.memory().database("ds_0").await;
        let target = harness.factory.memory().database("target").await;
        seed_orders(&source, 1..=3).await;

        let job_id = harness
            .api
            .create_and_start(&MigrationJobSpec::new(["ds_0.orders"], target_config()))
            .await
            .unwrap();
        harness.api.rollback(&job_id).await.unwrap();

        assert!(!target.has_table(&orders()).await);
        assert!(source.slots().await.is_empty());
        assert!(harness.repository.list_job_ids().await.unwrap().is_empty());
    }

    // Scenario: A caught-up job is checked, then a target row is altered
    // behind the job's back and the job is checked again.
    // Expected Outcome:
    // - The first check matches.
    // - The second check reports the altered key.
    // - Both check jobs are recorded, the latest with its results.
    #[traced_test]
    #[tokio::test]
    async fn consistency_check_detects_drift() {
        let harness = Harness::new().await;
        harness.register_sources(&["ds_0"]).await;
        let source = harness.factory.memory().database("ds_0").await;
        let target = harness.factory.memory().database("target").await;
        seed_orders(&source, 1..=10).await;

        let job_id = harness
            .api
            .create_and_start(&MigrationJobSpec::new(["ds_0.orders"], target_config()))
            .await
            .unwrap();
        wait_for_status(&harness.api, &job_id, JobStatus::RunningIncremental).await;

        let checks = harness.api.check_jobs();
        let results = checks
            .check(&job_id, &AlgorithmConfig::new("DATA_MATCH"))
            .await
            .unwrap();
        assert!(results["orders"].is_matched(), "{results:?}");

        target.update(&orders(), order_row(7, "tampered")).await.unwrap();
        let results = checks
            .check(&job_id, &AlgorithmConfig::new("DIGEST_MATCH"))
            .await
            .unwrap();
        let result = &results["orders"];
        assert!(result.count.is_matched());
        assert!(!result.content.matched);
        assert_eq!(result.content.first_mismatch_key, Some(Value::Int(7)));

        assert_eq!(checks.list_check_jobs(&job_id).await.unwrap().len(), 2);
        let report = checks.latest_results(&job_id).await.unwrap().unwrap();
        assert_eq!(report.progress.unwrap().status, JobStatus::Finished);
        assert_eq!(report.results["orders"].algorithm, "DIGEST_MATCH");
        harness.api.shutdown().await;
    }

    // Scenario: A previous process died mid-check, leaving its check job
    // CHECKING with no live owner, and the operator checks again.
    // Expected Outcome: The new check runs, and the abandoned check job is
    // marked CHECK_FAILURE.
    #[traced_test]
    #[tokio::test]
    async fn abandoned_check_does_not_block_new_checks() {
        let harness = Harness::new().await;
        harness.register_sources(&["ds_0"]).await;
        seed_orders(&*harness.factory.memory().database("ds_0").await, 1..=5).await;

        let job_id = harness
            .api
            .create_and_start(&MigrationJobSpec::new(["ds_0.orders"], target_config()))
            .await
            .unwrap();
        wait_for_status(&harness.api, &job_id, JobStatus::RunningIncremental).await;

        let abandoned = check_job_id(&job_id, 1);
        harness.repository.register_check_job(&job_id, 1, &abandoned).await.unwrap();
        let mut stale = JobItemProgress::new(Some(DatabaseKind::Memory));
        stale.status = JobStatus::Checking;
        harness.repository.persist_check_progress(&abandoned, &stale).await.unwrap();

        let checks = harness.api.check_jobs();
        let results = checks
            .check(&job_id, &AlgorithmConfig::new("DATA_MATCH"))
            .await
            .unwrap();
        assert!(results["orders"].is_matched(), "{results:?}");

        let abandoned_progress = harness.repository.load_check_progress(&abandoned).await.unwrap().unwrap();
        assert_eq!(abandoned_progress.status, JobStatus::CheckFailure);
        assert!(abandoned_progress.error_message.is_some());
        assert_eq!(checks.list_check_jobs(&job_id).await.unwrap().len(), 2);
        harness.api.shutdown().await;
    }

    // Scenario: Two checks of the same job are requested at once while
    // reads are throttled.
    // Expected Outcome: One check runs, the other is refused with
    // CheckJobRunning and exactly one check job is recorded.
    #[traced_test]
    #[tokio::test]
    async fn concurrent_checks_register_one_check_job() {
        let config = fast_process_config()
            .with_read_rate_limiter(AlgorithmConfig::new("QPS").with_prop("qps", 5))
            .with_check_chunk_size(2);
        let harness = Harness::with_config(config).await;
        harness.register_sources(&["ds_0"]).await;
        seed_orders(&*harness.factory.memory().database("ds_0").await, 1..=5).await;

        let job_id = harness
            .api
            .create_and_start(&MigrationJobSpec::new(["ds_0.orders"], target_config()))
            .await
            .unwrap();
        wait_for_status(&harness.api, &job_id, JobStatus::RunningIncremental).await;

        let checks = harness.api.check_jobs();
        let algorithm = AlgorithmConfig::new("DATA_MATCH");
        let (first, second) = tokio::join!(
            checks.check(&job_id, &algorithm),
            checks.check(&job_id, &algorithm)
        );
        let (passed, refused): (Vec<_>, Vec<_>) = [first, second].into_iter().partition(Result::is_ok);
        assert_eq!(passed.len(), 1);
        assert!(
            matches!(refused.as_slice(), [Err(JobError::CheckJobRunning(_))]),
            "{refused:?}"
        );
        assert_eq!(checks.list_check_jobs(&job_id).await.unwrap().len(), 1);
        harness.api.shutdown().await;
    }

    // Scenario: A check names an algorithm that does not exist.
    // Expected Outcome: The check is rejected before a check job is
    // registered.
    #[traced_test]
    #[tokio::test]
    async fn unknown_check_algorithm_is_rejected() {
        let harness = Harness::new().await;
        harness.register_sources(&["ds_0"]).await;
        seed_orders(&*harness.factory.memory().database("ds_0").await, 1..=3).await;

        let job_id = harness
            .api
            .create_and_start(&MigrationJobSpec::new(["ds_0.orders"], target_config()))
            .await
            .unwrap();
        let err = harness
            .api
            .check_jobs()
            .check(&job_id, &AlgorithmConfig::new("CRC32_MATCH"))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Check(_)), "{err}");
        assert!(harness.api.check_jobs().list_check_jobs(&job_id).await.unwrap().is_empty());
        harness.api.shutdown().await;
    }

    // Scenario: Source resources are registered, used by a job and dropped.
    // Expected Outcome:
    // - Registering a taken name fails.
    // - A resource used by a job cannot be dropped until the job is gone.
    #[traced_test]
    #[tokio::test]
    async fn source_resources_in_use_cannot_be_dropped() {
        let harness = Harness::new().await;
        harness.register_sources(&["ds_0", "ds_1"]).await;
        seed_orders(&*harness.factory.memory().database("ds_0").await, 1..=3).await;

        let mut again = std::collections::BTreeMap::new();
        again.insert("ds_0".to_string(), target_config());
        assert!(harness.api.add_source_connections(again).await.is_err());

        let job_id = harness
            .api
            .create_and_start(&MigrationJobSpec::new(["ds_0.orders"], target_config()))
            .await
            .unwrap();
        let err = harness
            .api
            .drop_source_connections(&["ds_0".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::ResourceInUse { .. }), "{err}");
        harness
            .api
            .drop_source_connections(&["ds_1".to_string()])
            .await
            .unwrap();

        harness.api.rollback(&job_id).await.unwrap();
        harness
            .api
            .drop_source_connections(&["ds_0".to_string()])
            .await
            .unwrap();
        assert!(harness.api.list_source_connections().await.unwrap().is_empty());
    }

    // Scenario: A job names a source table through an unregistered resource.
    // Expected Outcome: The job is rejected and nothing is stored.
    #[traced_test]
    #[tokio::test]
    async fn unknown_source_resource_is_rejected() {
        let harness = Harness::new().await;
        let err = harness
            .api
            .create_and_start(&MigrationJobSpec::new(["nowhere.orders"], target_config()))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Config(_)), "{err}");
        assert!(harness.repository.list_job_ids().await.unwrap().is_empty());
    }
}
