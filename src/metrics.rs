//! Prometheus metrics for the VM lifecycle core
//!
//! Collectors register with the default registry on first use.
//! [`encode_metrics`] renders everything in the text exposition format.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram, CounterVec, Encoder, Gauge,
    Histogram, TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // VM Lifecycle Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Time from a start request until the handle is registered
    pub static ref VM_BOOT_DURATION: Histogram = register_histogram!(
        "podvisor_vm_boot_duration_seconds",
        "Time to boot or reuse a VM and register it",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).expect("failed to register VM_BOOT_DURATION metric");

    /// Number of VMs currently in the registry
    pub static ref VMS_REGISTERED: Gauge = register_gauge!(
        "podvisor_vms_registered",
        "VMs currently registered"
    ).expect("failed to register VMS_REGISTERED metric");

    /// Lifecycle operations by outcome.
    ///
    /// Labels:
    /// - op: start, create, launch, kill, release, associate
    /// - outcome: ok, error
    pub static ref VM_OPERATIONS_TOTAL: CounterVec = register_counter_vec!(
        "podvisor_vm_operations_total",
        "VM lifecycle operations by outcome",
        &["op", "outcome"]
    ).expect("failed to register VM_OPERATIONS_TOTAL metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Pool Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    pub static ref POOL_WARM_VMS: Gauge = register_gauge!(
        "podvisor_pool_warm_vms",
        "Idle pre-booted VMs across all shapes"
    ).expect("failed to register POOL_WARM_VMS metric");

    /// Labels:
    /// - result: hit (warm VM reused), miss (booted on demand), stale (dead warm VM discarded)
    pub static ref POOL_ACQUIRE_TOTAL: CounterVec = register_counter_vec!(
        "podvisor_pool_acquire_total",
        "Pool acquisitions by result",
        &["result"]
    ).expect("failed to register POOL_ACQUIRE_TOTAL metric");
}

/// Render all registered metrics in the Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
