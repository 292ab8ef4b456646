//! Command handlers for the `herald` binary.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use colored::Colorize;
use herald_cache::{PurgeScope, RefreshOutcome, RefreshReport};
use herald_config::{CatalogWatcherConfig, watch_catalog};
use herald_server::{HeraldApp, ReportRequest};

use crate::cli::{DaemonArgs, DescribeArgs, PurgeArgs, RefreshArgs, ReportArgs};
use crate::output::{print_failure, print_json, print_skipped, print_success};

pub async fn report(app: &HeraldApp, args: &ReportArgs) -> Result<()> {
    let mut request = ReportRequest::new(&args.endpoint);
    request.info_type = args.info_type.clone();
    request.page = args.page;
    request.page_size = args.page_size;
    for (key, value) in &args.filters {
        request.filters.insert(key, value);
    }

    let response = app.service.fetch_report(&request).await?;
    if args.headers {
        for (name, value) in response.directive.to_headers() {
            eprintln!("{}: {}", name.cyan(), value);
        }
    }
    print_json(&response)
}

pub async fn refresh(app: &HeraldApp, args: &RefreshArgs) -> Result<()> {
    if let Some(endpoint) = &args.endpoint {
        if app.service.refresh_one(endpoint).await? {
            print_success(&format!("Dropped cached dataset of {endpoint}"));
        } else {
            print_skipped(&format!("No cached dataset for {endpoint}"));
        }
        return Ok(());
    }

    let reports = app.service.refresh_all().await;
    let failed = print_refresh_reports(&reports);
    if failed > 0 {
        bail!("{failed} of {} endpoint refreshes failed", reports.len());
    }
    Ok(())
}

fn print_refresh_reports(reports: &[RefreshReport]) -> usize {
    let mut failed = 0;
    for report in reports {
        let elapsed = report.duration.as_millis();
        match &report.outcome {
            RefreshOutcome::Refreshed { info_types, rows } => print_success(&format!(
                "{} ({} rows across {}) in {elapsed}ms",
                report.endpoint,
                rows,
                info_types.join(", ")
            )),
            RefreshOutcome::SkippedNotEnabled => {
                print_skipped(&format!("{} (dataset cache not enabled)", report.endpoint))
            }
            RefreshOutcome::Failed(e) => {
                failed += 1;
                print_failure(&format!("{}: {e}", report.endpoint));
            }
        }
    }
    failed
}

pub async fn cached(app: &HeraldApp) -> Result<()> {
    let entries = app.service.list_cached().await?;
    if entries.is_empty() {
        print_skipped("No cached datasets");
        return Ok(());
    }
    print_json(&entries)
}

pub async fn purge(app: &HeraldApp, args: &PurgeArgs) -> Result<()> {
    let scope = match &args.endpoint {
        Some(endpoint) => PurgeScope::Endpoint(endpoint.clone()),
        None => PurgeScope::All,
    };
    let report = app.service.purge_proxy(&scope).await?;
    print_success(&format!(
        "Purged {} of {} proxy cache files ({} bytes)",
        report.files_removed, report.files_scanned, report.bytes_removed
    ));
    Ok(())
}

pub fn endpoints(app: &HeraldApp) -> Result<()> {
    print_json(&app.service.list_endpoints())
}

pub async fn describe(app: &HeraldApp, args: &DescribeArgs) -> Result<()> {
    let adapter = app
        .report_adapter
        .as_ref()
        .context("report API is not configured (sources.report.base_url)")?;
    let description = adapter.describe(&args.report_id).await?;
    print_json(&description)
}

/// Refreshes on an interval until Ctrl-C, reloading the catalog on change.
pub async fn daemon(app: &HeraldApp, args: &DaemonArgs) -> Result<()> {
    if app.service.dataset_cache().is_none() {
        bail!("dataset cache is disabled (cache.enabled = false)");
    }

    let interval = args
        .interval
        .unwrap_or(app.config.cache.refresh_interval_secs)
        .max(1);
    let interval = Duration::from_secs(interval);
    let mut watcher = if app.config.endpoints.watch {
        Some(watch_catalog(app.registry.clone(), CatalogWatcherConfig::default())?)
    } else {
        None
    };

    tracing::info!(interval_secs = interval.as_secs(), "Refresh daemon started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => run_refresh(&app.service).await,
            Some(count) = next_reload(&mut watcher) => {
                tracing::info!(endpoints = count, "Endpoint catalog reloaded");
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
        }
    }

    if let Some(watcher) = watcher {
        watcher.stop().await;
    }
    Ok(())
}

async fn next_reload(watcher: &mut Option<herald_config::WatchHandle>) -> Option<usize> {
    match watcher {
        Some(handle) => handle.next_reload().await,
        None => std::future::pending().await,
    }
}

async fn run_refresh(service: &Arc<herald_server::ReportService>) {
    let reports = service.refresh_all().await;
    let refreshed = reports.iter().filter(|r| r.is_success()).count();
    let failed = reports
        .iter()
        .filter(|r| matches!(r.outcome, RefreshOutcome::Failed(_)))
        .count();
    tracing::info!(refreshed, failed, "Scheduled refresh finished");
    if let Some(rendered) = herald_server::metrics::render_metrics() {
        tracing::debug!(metrics = %rendered, "Metrics snapshot");
    }
}
