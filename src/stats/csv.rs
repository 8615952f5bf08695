use crate::stats::ReportStats;

fn safe_name(name: &str) -> String {
    name.replace([' ', ':', ',', '{', '}', '/'], "_")
}

/// Flatten a report into `metric_name,metric_type,value` rows.
pub fn generate_csv(report: &ReportStats) -> String {
    let mut out = String::from("metric_name,metric_type,value\n");

    out.push_str(&format!("http_reqs,counter,{}\n", report.total_requests));
    out.push_str(&format!(
        "http_req_failed,rate,{:.4}\n",
        report.failure_rate
    ));
    out.push_str(&format!("http_req_rps,gauge,{:.3}\n", report.rps));
    for (suffix, value) in [
        ("avg", report.avg_latency_ms),
        ("min", report.min_latency_ms),
        ("max", report.max_latency_ms),
        ("p50", report.p50_latency_ms),
        ("p90", report.p90_latency_ms),
        ("p95", report.p95_latency_ms),
        ("p99", report.p99_latency_ms),
    ] {
        out.push_str(&format!("http_req_duration_{},gauge,{:.3}\n", suffix, value));
    }
    out.push_str(&format!("iterations,counter,{}\n", report.iterations));
    out.push_str(&format!(
        "iteration_duration_avg,gauge,{:.3}\n",
        report.avg_iteration_ms
    ));

    let mut codes: Vec<_> = report.status_codes.iter().collect();
    codes.sort_by_key(|a| a.0);
    for (code, count) in codes {
        out.push_str(&format!("http_req_status_{},counter,{}\n", code, count));
    }

    if !report.checks.is_empty() {
        out.push_str(&format!("checks,rate,{:.4}\n", report.check_pass_rate));
    }
    // (total, passes) per check
    let mut checks: Vec<_> = report.checks.iter().collect();
    checks.sort_by_key(|a| a.0);
    for (name, (total, passes)) in checks {
        let name = safe_name(name);
        out.push_str(&format!("check_{}_passed,counter,{}\n", name, passes));
        out.push_str(&format!("check_{}_failed,counter,{}\n", name, total - passes));
    }

    let mut groups: Vec<_> = report.grouped_requests.iter().collect();
    groups.sort_by_key(|a| a.0);
    for (name, stats) in groups {
        let name = safe_name(name);
        out.push_str(&format!("req_{}_count,counter,{}\n", name, stats.total_requests));
        out.push_str(&format!("req_{}_p95,gauge,{:.3}\n", name, stats.p95_latency_ms));
    }

    for scenario in &report.scenarios {
        let name = safe_name(&scenario.name);
        out.push_str(&format!(
            "scenario_{}_peak_workers,gauge,{}\n",
            name, scenario.peak_workers
        ));
        out.push_str(&format!(
            "scenario_{}_workers_started,counter,{}\n",
            name, scenario.workers_started
        ));
    }

    for verdict in &report.thresholds {
        out.push_str(&format!(
            "threshold_{}_{},threshold,{}\n",
            safe_name(&verdict.metric),
            safe_name(&verdict.expression),
            if verdict.passed { "pass" } else { "fail" }
        ));
    }

    out.push_str(&format!("run_aborted,flag,{}\n", u8::from(report.aborted)));
    if let Some(reason) = &report.abort_reason {
        out.push_str(&format!("abort_reason,text,\"{}\"\n", reason.replace('"', "\"\"")));
    }

    out
}
