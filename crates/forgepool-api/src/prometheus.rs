//! Prometheus text exposition format.
//!
//! Renders the pool status into the Prometheus text exposition format
//! for scraping by a Prometheus server or compatible agent.

use forgepool_scaler::PoolStatus;

/// Render the pool status into Prometheus text format.
pub fn render_prometheus(status: &PoolStatus) -> String {
    let mut out = String::new();

    out.push_str("# HELP forgepool_pool_size Instances counting toward capacity.\n");
    out.push_str("# TYPE forgepool_pool_size gauge\n");
    out.push_str(&format!("forgepool_pool_size {}\n", status.current_size));

    out.push_str("# HELP forgepool_desired_size Target pool size from the last demand read.\n");
    out.push_str("# TYPE forgepool_desired_size gauge\n");
    out.push_str(&format!("forgepool_desired_size {}\n", status.desired_size));

    out.push_str("# HELP forgepool_pending_jobs Jobs waiting for an agent.\n");
    out.push_str("# TYPE forgepool_pending_jobs gauge\n");
    out.push_str(&format!("forgepool_pending_jobs {}\n", status.pending_jobs));

    out.push_str("# HELP forgepool_busy_agents Agents currently running a job.\n");
    out.push_str("# TYPE forgepool_busy_agents gauge\n");
    out.push_str(&format!("forgepool_busy_agents {}\n", status.busy_agents));

    out.push_str("# HELP forgepool_instances Instances by lifecycle state.\n");
    out.push_str("# TYPE forgepool_instances gauge\n");
    for (state, count) in status.state_counts() {
        out.push_str(&format!(
            "forgepool_instances{{state=\"{state}\"}} {count}\n"
        ));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_status() -> PoolStatus {
        PoolStatus {
            current_size: 3,
            desired_size: 4,
            min_size: 1,
            max_size: 4,
            pending_jobs: 2,
            busy_agents: 1,
            provisioning: 1,
            registering: 0,
            active: 2,
            draining: 1,
            terminating: 0,
            terminated: 0,
            updated_at: 1000,
        }
    }

    #[test]
    fn render_has_type_declarations() {
        let output = render_prometheus(&PoolStatus::default());
        assert!(output.contains("# HELP forgepool_pool_size"));
        assert!(output.contains("# TYPE forgepool_pool_size gauge"));
    }

    #[test]
    fn render_pool_gauges() {
        let output = render_prometheus(&test_status());

        assert!(output.contains("forgepool_pool_size 3"));
        assert!(output.contains("forgepool_desired_size 4"));
        assert!(output.contains("forgepool_pending_jobs 2"));
        assert!(output.contains("forgepool_busy_agents 1"));
    }

    #[test]
    fn render_covers_every_lifecycle_state() {
        let output = render_prometheus(&test_status());

        for state in [
            "provisioning",
            "registering",
            "active",
            "draining",
            "terminating",
            "terminated",
        ] {
            assert!(
                output.contains(&format!("forgepool_instances{{state=\"{state}\"}}")),
                "missing gauge for {state}"
            );
        }
        assert!(output.contains("forgepool_instances{state=\"active\"} 2"));
        assert!(output.contains("forgepool_instances{state=\"draining\"} 1"));
    }

    #[test]
    fn render_format_is_prometheus_compatible() {
        let output = render_prometheus(&test_status());

        // Every non-comment line is `metric value` or `metric{labels} value`.
        for line in output.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.rsplitn(2, ' ');
            let value = parts.next().unwrap();
            assert!(value.parse::<f64>().is_ok(), "bad value in line: {line}");
            assert!(parts.next().is_some(), "missing metric name: {line}");
        }
    }
}
