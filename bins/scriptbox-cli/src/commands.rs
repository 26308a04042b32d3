// CLI commands for inspecting scripts and profiles
use anyhow::{bail, Context, Result};
use scriptbox_common::analyzer::{AnalyzerRules, ScriptAnalysis, ScriptAnalyzer};
use scriptbox_common::profiles::{ProfileTable, ResolvedLimits};
use scriptbox_common::types::{CustomLimits, ProfileName};
use std::fs;
use std::path::Path;

fn load_analyzer(rules: Option<&Path>) -> Result<ScriptAnalyzer> {
    match rules {
        Some(path) => {
            let rules = AnalyzerRules::load(path)
                .with_context(|| format!("Failed to load rules from {}", path.display()))?;
            ScriptAnalyzer::new(rules).context("Invalid analyzer rules")
        }
        None => Ok(ScriptAnalyzer::default()),
    }
}

fn load_profiles(config: &Path) -> Result<ProfileTable> {
    ProfileTable::load_or_default(config)
        .with_context(|| format!("Failed to load profiles from {}", config.display()))
}

fn print_list(label: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    println!("  {}:", label);
    for item in items {
        println!("    - {}", item);
    }
}

fn print_analysis(analysis: &ScriptAnalysis) {
    println!("📊 Profile:     {}", analysis.recommended_profile);
    println!("⚙️  Mode:        {}", analysis.execution_mode);
    println!("🎯 Confidence:  {:.2}", analysis.confidence);
    println!("📝 Reasoning:   {}", analysis.reasoning);
    print_list("Libraries", &analysis.detected_libraries);
    print_list("GPU indicators", &analysis.gpu_indicators);
    print_list("Memory indicators", &analysis.memory_indicators);
    print_list("Compute indicators", &analysis.compute_indicators);
}

/// Analyze a script file and print the recommendation
pub fn analyze_file(file: &Path, gpu: bool, rules: Option<&Path>, json: bool) -> Result<()> {
    let script = fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let analysis = load_analyzer(rules)?.analyze(&script, gpu);

    if json {
        println!("{}", serde_json::to_string_pretty(&analysis)?);
    } else {
        println!("🔍 Analyzing {}", file.display());
        print_analysis(&analysis);
    }
    Ok(())
}

pub fn list_profiles(config: &Path) -> Result<()> {
    let table = load_profiles(config)?;
    println!(
        "{:<8} {:>10} {:>11} {:>12} {:>5}",
        "NAME", "CPU SHARES", "MEMORY MB", "TIMEOUT (s)", "GPU"
    );
    for profile in table.profiles() {
        println!(
            "{:<8} {:>10} {:>11} {:>12} {:>5}",
            profile.name,
            profile.cpu_shares,
            profile.memory_mb,
            profile.timeout_seconds,
            if profile.gpu { "yes" } else { "no" }
        );
    }
    Ok(())
}

fn resolve(
    table: &ProfileTable,
    profile: &str,
    memory_mb: Option<u32>,
    cpu_shares: Option<u32>,
    timeout: Option<u64>,
) -> Result<ResolvedLimits> {
    let name: ProfileName = profile.parse()?;
    if name == ProfileName::Auto {
        bail!("'auto' is decided per script; use `analyze` instead");
    }
    let custom = CustomLimits {
        memory_mb,
        cpu_shares,
        timeout_seconds: timeout,
    };
    let custom = (!custom.is_empty()).then_some(custom);
    Ok(table.resolve(name, custom.as_ref()))
}

pub fn resolve_limits(
    profile: &str,
    config: &Path,
    memory_mb: Option<u32>,
    cpu_shares: Option<u32>,
    timeout: Option<u64>,
) -> Result<()> {
    let table = load_profiles(config)?;
    let limits = resolve(&table, profile, memory_mb, cpu_shares, timeout)?;
    println!("{}", serde_json::to_string_pretty(&limits)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_clamps_overrides() {
        let table = ProfileTable::default();
        let limits = resolve(&table, "small", Some(100_000), None, Some(1)).unwrap();
        assert_eq!(limits.memory_mb, 8192);
        assert_eq!(limits.cpu_shares, 512);
        assert_eq!(limits.timeout_seconds, 10);
    }

    #[test]
    fn test_resolve_rejects_auto_and_unknown() {
        let table = ProfileTable::default();
        assert!(resolve(&table, "auto", None, None, None).is_err());
        assert!(resolve(&table, "huge", None, None, None).is_err());
    }
}
