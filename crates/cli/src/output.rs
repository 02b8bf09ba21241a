use crate::error::CliError;
use engine_runtime::api::{check::CheckJobReport, migration::JobSummary};
use model::job::{
    check::ConsistencyCheckResult, datasource::DataSourceConfig, progress::JobItemProgress,
};
use serde::Serialize;
use std::collections::BTreeMap;

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn print_sources(sources: &BTreeMap<String, DataSourceConfig>) {
    println!("{:<16} {:<12} URL", "NAME", "KIND");
    for (name, config) in sources {
        println!("{:<16} {:<12} {}", name, config.kind.as_str(), config.redacted_url());
    }
}

pub fn print_progress(job_id: &str, progress: &BTreeMap<usize, JobItemProgress>) {
    println!("Progress for job '{job_id}':");
    println!(
        "{:<6} {:<32} {:>12} {:>10}  ERROR",
        "SHARD", "STATUS", "RECORDS", "INVENTORY"
    );
    for (shard, p) in progress {
        println!(
            "{:<6} {:<32} {:>12} {:>9}%  {}",
            shard,
            p.status.as_str(),
            p.processed_records,
            p.inventory_finished_percentage(),
            p.error_message.as_deref().unwrap_or("")
        );
    }
}

pub fn print_jobs(jobs: &[JobSummary]) {
    println!(
        "{:<38} {:<24} {:>6} {:<32} {:>12}",
        "JOB ID", "TABLE", "SHARDS", "STATUS", "RECORDS"
    );
    for job in jobs {
        println!(
            "{:<38} {:<24} {:>6} {:<32} {:>12}",
            job.job_id.as_str(),
            job.target_table,
            job.sharding_count,
            job.status.as_str(),
            job.processed_records
        );
    }
}

pub fn print_check_results(results: &BTreeMap<String, ConsistencyCheckResult>) {
    println!(
        "{:<24} {:<14} {:>10} {:>10} {:<8} FIRST MISMATCH",
        "TABLE", "ALGORITHM", "SOURCE", "TARGET", "MATCHED"
    );
    for (table, result) in results {
        let mismatch = result
            .content
            .first_mismatch_key
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        println!(
            "{:<24} {:<14} {:>10} {:>10} {:<8} {}",
            table,
            result.algorithm,
            result.count.source_records,
            result.count.target_records,
            result.is_matched(),
            mismatch
        );
    }
}

pub fn print_check_report(report: &CheckJobReport) {
    let status = report
        .progress
        .as_ref()
        .map(|p| p.status.to_string())
        .unwrap_or_else(|| "n/a".to_string());
    println!("Check job '{}': {status}", report.check_job_id);
    if let Some(error) = report.progress.as_ref().and_then(|p| p.error_message.as_deref()) {
        println!("Error: {error}");
    }
    print_check_results(&report.results);
}
