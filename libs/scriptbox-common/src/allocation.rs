// Submission-time allocation
// Folds the requested mode/profile, analyzer output and custom limits into
// the effective allocation a job is created with.

use crate::analyzer::{ScriptAnalysis, ScriptAnalyzer};
use crate::profiles::clamp_timeout_seconds;
use crate::types::{Allocation, CustomLimits, ExecutionMode, JobSpec, ProfileName};

pub fn allocate(spec: &JobSpec, analyzer: &ScriptAnalyzer, gpu_available: bool) -> Allocation {
    let auto_mode = spec.execution_mode == ExecutionMode::Auto;
    let auto_profile = spec.resource_profile == ProfileName::Auto;

    let analysis: Option<ScriptAnalysis> = if auto_mode || auto_profile {
        Some(analyzer.analyze(&spec.script, gpu_available))
    } else {
        None
    };

    let resource_profile = match (&analysis, auto_profile) {
        (Some(a), true) => a.recommended_profile,
        _ => spec.resource_profile,
    };

    let execution_mode = if !auto_mode {
        spec.execution_mode
    } else if spec.resource_profile == ProfileName::Gpu {
        // an explicit gpu profile implies gpu execution
        ExecutionMode::Gpu
    } else {
        analysis
            .as_ref()
            .map(|a| a.execution_mode)
            .unwrap_or(ExecutionMode::Cpu)
    };

    let timeout_seconds = clamp_timeout_seconds(
        spec.custom_limits
            .as_ref()
            .and_then(|c| c.timeout_seconds)
            .unwrap_or(spec.timeout_seconds),
    );

    let mut notes = Vec::new();
    if let Some(a) = &analysis {
        notes.push(a.reasoning.clone());
    }
    if let Some(custom) = spec.custom_limits.as_ref().filter(|c| !c.is_empty()) {
        notes.push(describe_custom(custom));
    }

    Allocation {
        execution_mode,
        resource_profile,
        timeout_seconds,
        auto_allocated: analysis.is_some(),
        reasoning: if notes.is_empty() {
            None
        } else {
            Some(notes.join(" | "))
        },
    }
}

fn describe_custom(custom: &CustomLimits) -> String {
    let mut parts = Vec::new();
    if let Some(m) = custom.memory_mb {
        parts.push(format!("memory_mb={}", m));
    }
    if let Some(c) = custom.cpu_shares {
        parts.push(format!("cpu_shares={}", c));
    }
    if let Some(t) = custom.timeout_seconds {
        parts.push(format!("timeout_seconds={}", t));
    }
    format!("Custom limits: {}", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TORCH: &str = "import torch\nx = torch.zeros(3).cuda()\n";

    #[test]
    fn test_auto_uses_analysis() {
        let analyzer = ScriptAnalyzer::default();
        let alloc = allocate(&JobSpec::new(TORCH), &analyzer, true);
        assert_eq!(alloc.execution_mode, ExecutionMode::Gpu);
        assert_eq!(alloc.resource_profile, ProfileName::Gpu);
        assert!(alloc.auto_allocated);
        assert!(alloc.reasoning.unwrap().contains("GPU recommended"));
    }

    #[test]
    fn test_explicit_values_override_analysis() {
        let analyzer = ScriptAnalyzer::default();
        let mut spec = JobSpec::new(TORCH);
        spec.execution_mode = ExecutionMode::Cpu;
        spec.resource_profile = ProfileName::Small;
        let alloc = allocate(&spec, &analyzer, true);
        assert_eq!(alloc.execution_mode, ExecutionMode::Cpu);
        assert_eq!(alloc.resource_profile, ProfileName::Small);
        assert!(!alloc.auto_allocated);
        assert!(alloc.reasoning.is_none());
    }

    #[test]
    fn test_gpu_profile_forces_gpu_mode() {
        let analyzer = ScriptAnalyzer::default();
        let mut spec = JobSpec::new("print('hi')");
        spec.resource_profile = ProfileName::Gpu;
        let alloc = allocate(&spec, &analyzer, false);
        assert_eq!(alloc.execution_mode, ExecutionMode::Gpu);
        assert_eq!(alloc.resource_profile, ProfileName::Gpu);
    }

    #[test]
    fn test_custom_timeout_replaces_requested() {
        let analyzer = ScriptAnalyzer::default();
        let mut spec = JobSpec::new("print('hi')");
        spec.timeout_seconds = 120;
        spec.custom_limits = Some(CustomLimits {
            timeout_seconds: Some(99_999),
            ..Default::default()
        });
        let alloc = allocate(&spec, &analyzer, false);
        assert_eq!(alloc.timeout_seconds, 3600);
        assert!(alloc
            .reasoning
            .unwrap()
            .ends_with("Custom limits: timeout_seconds=99999"));
    }

    #[test]
    fn test_requested_timeout_is_clamped() {
        let analyzer = ScriptAnalyzer::default();
        let mut spec = JobSpec::new("print('hi')");
        spec.timeout_seconds = 1;
        assert_eq!(allocate(&spec, &analyzer, false).timeout_seconds, 10);
    }
}
