//! Output rendering for gsastctl.

use crate::client::ScanInfo;

pub fn print_scan_created(scan_id: &str) {
    println!("Scan started: {}", scan_id);
}

pub fn print_scan_status(info: &ScanInfo) {
    println!("Scan:    {}", info.scan_id);
    println!("Status:  {}", info.status);
    println!("Message: {}", info.message);
    if !info.jobs.is_empty() {
        println!("Jobs:");
        let mut statuses: Vec<_> = info.jobs.iter().collect();
        statuses.sort_by_key(|(status, _)| status.to_string());
        for (status, count) in statuses {
            println!("  {:<10} {}", status, count);
        }
    }
}

pub fn print_scan_list(scans: &[String]) {
    if scans.is_empty() {
        println!("No scans found.");
        return;
    }
    for scan_id in scans {
        println!("{}", scan_id);
    }
    println!();
    println!("{} scan(s)", scans.len());
}

pub fn print_project_list(projects: &[String]) {
    if projects.is_empty() {
        println!("No cached projects.");
        return;
    }
    for project in projects {
        println!("{}", project);
    }
    println!();
    println!("{} project(s)", projects.len());
}

pub fn print_results(results: &serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(results).unwrap_or_else(|_| results.to_string()));
}
