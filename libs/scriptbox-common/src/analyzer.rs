// Script analyzer
// Recommends a resource profile and execution mode from script source text.
// The lookup tables and pattern lists live in `AnalyzerRules` so they can be
// swapped out or loaded from JSON without touching the decision logic.

use crate::types::{ExecutionMode, ProfileName};
use lazy_static::lazy_static;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

const GPU_WEIGHT: u32 = 3;
const MEMORY_WEIGHT: u32 = 2;
const COMPUTE_WEIGHT: u32 = 2;
const FALLBACK_NOTE: &str = " (GPU not available, using CPU fallback)";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryRule {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternRule {
    pub pattern: String,
    pub description: String,
}

/// Domain knowledge the analyzer runs on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzerRules {
    pub gpu_libraries: Vec<LibraryRule>,
    pub memory_libraries: Vec<LibraryRule>,
    /// Ordered; each match adds one compute indicator
    pub compute_patterns: Vec<PatternRule>,
    pub gpu_patterns: Vec<PatternRule>,
}

#[derive(Debug, thiserror::Error)]
pub enum RulesError {
    #[error("failed to read analyzer rules: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse analyzer rules: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

fn libs(entries: &[(&str, &str)]) -> Vec<LibraryRule> {
    entries
        .iter()
        .map(|(name, description)| LibraryRule {
            name: name.to_string(),
            description: description.to_string(),
        })
        .collect()
}

fn patterns(entries: &[(&str, &str)]) -> Vec<PatternRule> {
    entries
        .iter()
        .map(|(pattern, description)| PatternRule {
            pattern: pattern.to_string(),
            description: description.to_string(),
        })
        .collect()
}

impl Default for AnalyzerRules {
    fn default() -> Self {
        Self {
            gpu_libraries: libs(&[
                ("torch", "PyTorch deep learning"),
                ("tensorflow", "TensorFlow deep learning"),
                ("keras", "Keras neural networks"),
                ("cupy", "CUDA-accelerated NumPy"),
                ("cudf", "CUDA DataFrame"),
                ("cuml", "CUDA Machine Learning"),
                ("pycuda", "Python CUDA bindings"),
                ("numba", "JIT compiler (may use GPU)"),
                ("jax", "JAX accelerated computing"),
                ("mxnet", "MXNet deep learning"),
                ("paddle", "PaddlePaddle deep learning"),
                ("onnxruntime", "ONNX Runtime (may use GPU)"),
            ]),
            memory_libraries: libs(&[
                ("pandas", "DataFrame operations"),
                ("numpy", "Numerical computing"),
                ("scipy", "Scientific computing"),
                ("sklearn", "Machine Learning"),
                ("scikit-learn", "Machine Learning"),
                ("xgboost", "Gradient Boosting"),
                ("lightgbm", "Light Gradient Boosting"),
                ("catboost", "CatBoost"),
                ("dask", "Parallel computing"),
                ("polars", "Fast DataFrame"),
                ("vaex", "Out-of-core DataFrames"),
                ("modin", "Parallel Pandas"),
                ("opencv", "Computer Vision"),
                ("cv2", "OpenCV"),
                ("PIL", "Image Processing"),
                ("pillow", "Image Processing"),
                ("matplotlib", "Plotting (memory for figures)"),
                ("seaborn", "Statistical visualization"),
                ("plotly", "Interactive plots"),
            ]),
            compute_patterns: patterns(&[
                (r"\.fit\s*\(", "Model training detected"),
                (r"\.train\s*\(", "Training loop detected"),
                (r"for\s+epoch\s+in", "Epoch loop detected"),
                (r"for\s+\w+\s+in\s+range\s*\(\s*\d{4,}", "Large iteration loop"),
                (r"while\s+True", "Infinite loop pattern"),
                (r"\.cuda\s*\(", "CUDA tensor transfer"),
                (r#"\.to\s*\(\s*['"]cuda"#, "CUDA device transfer"),
                (r#"torch\.device\s*\(\s*['"]cuda"#, "CUDA device creation"),
                (r"with\s+tf\.device.*GPU", "TensorFlow GPU context"),
                (r"model\.compile", "Keras model compilation"),
                (r"DataLoader", "PyTorch DataLoader"),
                (r"tf\.data\.Dataset", "TensorFlow Dataset"),
                (r"\.backward\s*\(", "Backpropagation"),
                (r"optimizer\.step", "Optimizer step"),
                (r"\.predict\s*\(", "Model prediction"),
                (r"\.transform\s*\(", "Data transformation"),
                (r"multiprocessing", "Multiprocessing"),
                (r"ThreadPoolExecutor", "Thread pool"),
                (r"ProcessPoolExecutor", "Process pool"),
            ]),
            gpu_patterns: patterns(&[
                (r"\.cuda\s*\(", "CUDA transfer"),
                (r#"\.to\s*\(\s*['"]cuda"#, "To CUDA device"),
                (r"torch\.cuda", "PyTorch CUDA"),
                (r"tf\.config.*GPU", "TensorFlow GPU config"),
                (r"with\s+tf\.device.*GPU", "TensorFlow GPU device"),
                (r"gpu_options", "GPU options"),
                (r"CUDA_VISIBLE_DEVICES", "CUDA environment"),
                (r"cupy\.", "CuPy operations"),
                (r"@cuda\.jit", "Numba CUDA JIT"),
                (r#"device\s*=\s*['"]cuda"#, "CUDA device assignment"),
            ]),
        }
    }
}

impl AnalyzerRules {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, RulesError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptAnalysis {
    pub recommended_profile: ProfileName,
    pub execution_mode: ExecutionMode,
    pub detected_libraries: Vec<String>,
    pub gpu_indicators: Vec<String>,
    pub memory_indicators: Vec<String>,
    pub compute_indicators: Vec<String>,
    pub confidence: f64,
    pub reasoning: String,
}

#[derive(Debug, Clone)]
struct CompiledPattern {
    regex: Regex,
    description: String,
}

#[derive(Debug, Clone)]
struct BareReference {
    name: String,
    regex: Regex,
}

#[derive(Debug, Clone)]
pub struct ScriptAnalyzer {
    rules: AnalyzerRules,
    compute: Vec<CompiledPattern>,
    gpu: Vec<CompiledPattern>,
    bare_refs: Vec<BareReference>,
}

lazy_static! {
    static ref DEFAULT_ANALYZER: ScriptAnalyzer = ScriptAnalyzer::new(AnalyzerRules::default())
        .expect("built-in analyzer patterns must compile");
    static ref IMPORT_STMT: Regex = Regex::new(r"(?m)^[ \t]*import[ \t]+([^;#\r\n]+)")
        .expect("import pattern must compile");
    static ref FROM_STMT: Regex = Regex::new(r"(?m)^[ \t]*from[ \t]+(\w+)")
        .expect("from pattern must compile");
}

fn compile(rules: &[PatternRule]) -> Result<Vec<CompiledPattern>, RulesError> {
    rules
        .iter()
        .map(|rule| {
            RegexBuilder::new(&rule.pattern)
                .case_insensitive(true)
                .build()
                .map(|regex| CompiledPattern {
                    regex,
                    description: rule.description.clone(),
                })
                .map_err(|source| RulesError::Pattern {
                    pattern: rule.pattern.clone(),
                    source,
                })
        })
        .collect()
}

impl ScriptAnalyzer {
    pub fn new(rules: AnalyzerRules) -> Result<Self, RulesError> {
        let compute = compile(&rules.compute_patterns)?;
        let gpu = compile(&rules.gpu_patterns)?;

        // `name.` or `name(` not preceded by another identifier character
        let mut bare_refs = Vec::new();
        for lib in rules.gpu_libraries.iter().chain(&rules.memory_libraries) {
            let pattern = format!(r"(?m)(?:^|[^\w.]){}[.(]", regex::escape(&lib.name));
            let regex = Regex::new(&pattern).map_err(|source| RulesError::Pattern {
                pattern: pattern.clone(),
                source,
            })?;
            bare_refs.push(BareReference {
                name: lib.name.clone(),
                regex,
            });
        }

        Ok(Self {
            rules,
            compute,
            gpu,
            bare_refs,
        })
    }

    pub fn rules(&self) -> &AnalyzerRules {
        &self.rules
    }

    /// Analyze a script. Never fails; any input yields a recommendation.
    pub fn analyze(&self, script: &str, gpu_available: bool) -> ScriptAnalysis {
        if script.trim().is_empty() {
            return ScriptAnalysis {
                recommended_profile: ProfileName::Small,
                execution_mode: ExecutionMode::Cpu,
                detected_libraries: Vec::new(),
                gpu_indicators: Vec::new(),
                memory_indicators: Vec::new(),
                compute_indicators: Vec::new(),
                confidence: 1.0,
                reasoning: "empty script".to_string(),
            };
        }

        let detected = self.detect_libraries(script);
        let gpu_indicators = self.gpu_indicators(script, &detected);
        let memory_indicators = self.memory_indicators(&detected);
        let compute_indicators = matching_descriptions(&self.compute, script);

        let gpu_score = GPU_WEIGHT * gpu_indicators.len() as u32;
        let memory_score = MEMORY_WEIGHT * memory_indicators.len() as u32;
        let compute_score = COMPUTE_WEIGHT * compute_indicators.len() as u32;
        let total = gpu_score + memory_score + compute_score;

        let mut reasoning = Vec::new();
        let (mut profile, mut mode, confidence) = if gpu_score >= 3 {
            reasoning.push(format!(
                "GPU recommended ({} GPU indicators)",
                gpu_indicators.len()
            ));
            reasoning.push("Using GPU profile for deep learning workload".to_string());
            (
                ProfileName::Gpu,
                ExecutionMode::Gpu,
                (0.5 + gpu_score as f64 * 0.1).min(0.9),
            )
        } else if total >= 8 {
            reasoning.push("Heavy computation detected - using large profile".to_string());
            (
                ProfileName::Large,
                ExecutionMode::Cpu,
                (0.5 + total as f64 * 0.05).min(0.85),
            )
        } else if total >= 4 {
            reasoning.push("Moderate resource needs - using medium profile".to_string());
            (
                ProfileName::Medium,
                ExecutionMode::Cpu,
                (0.5 + total as f64 * 0.05).min(0.8),
            )
        } else if memory_score >= 2 {
            reasoning.push("Memory-intensive libraries detected".to_string());
            (ProfileName::Medium, ExecutionMode::Cpu, 0.7)
        } else {
            reasoning.push("Simple script - using small profile".to_string());
            (ProfileName::Small, ExecutionMode::Cpu, 0.8)
        };

        if !detected.is_empty() {
            let mut shown: Vec<String> = detected.iter().take(5).cloned().collect();
            if detected.len() > 5 {
                shown.push(format!("...and {} more", detected.len() - 5));
            }
            reasoning.push(format!("Detected: {}", shown.join(", ")));
        }

        let mut reasoning = reasoning.join(". ");
        if mode == ExecutionMode::Gpu && !gpu_available {
            mode = ExecutionMode::Cpu;
            if profile == ProfileName::Gpu {
                profile = ProfileName::Large;
            }
            reasoning.push_str(FALLBACK_NOTE);
        }

        ScriptAnalysis {
            recommended_profile: profile,
            execution_mode: mode,
            detected_libraries: detected,
            gpu_indicators,
            memory_indicators,
            compute_indicators,
            confidence,
            reasoning,
        }
    }

    fn detect_libraries(&self, script: &str) -> Vec<String> {
        let mut found: BTreeSet<String> = extract_imports(script).into_iter().collect();
        for bare in &self.bare_refs {
            if !found.contains(&bare.name) && bare.regex.is_match(script) {
                found.insert(bare.name.clone());
            }
        }
        found.into_iter().collect()
    }

    fn gpu_indicators(&self, script: &str, detected: &[String]) -> Vec<String> {
        let mut indicators = Vec::new();
        for lib in &self.rules.gpu_libraries {
            if detected.contains(&lib.name) {
                push_unique(
                    &mut indicators,
                    format!("Library: {} ({})", lib.name, lib.description),
                );
            }
        }
        for description in matching_descriptions(&self.gpu, script) {
            push_unique(&mut indicators, format!("Pattern: {}", description));
        }
        indicators
    }

    fn memory_indicators(&self, detected: &[String]) -> Vec<String> {
        let mut indicators = Vec::new();
        for lib in &self.rules.memory_libraries {
            if detected.contains(&lib.name) {
                push_unique(
                    &mut indicators,
                    format!("{} ({})", lib.name, lib.description),
                );
            }
        }
        indicators
    }
}

impl Default for ScriptAnalyzer {
    fn default() -> Self {
        DEFAULT_ANALYZER.clone()
    }
}

/// Analyze with the built-in rules
pub fn analyze(script: &str, gpu_available: bool) -> ScriptAnalysis {
    DEFAULT_ANALYZER.analyze(script, gpu_available)
}

fn matching_descriptions(patterns: &[CompiledPattern], script: &str) -> Vec<String> {
    let mut out = Vec::new();
    for p in patterns {
        if p.regex.is_match(script) {
            push_unique(&mut out, p.description.clone());
        }
    }
    out
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

fn leading_word(s: &str) -> &str {
    let s = s.trim_start();
    let end = s
        .find(|c: char| !(c.is_alphanumeric() || c == '_'))
        .unwrap_or(s.len());
    &s[..end]
}

fn is_identifier(s: &str) -> bool {
    s.chars()
        .next()
        .map_or(false, |c| c.is_alphabetic() || c == '_')
}

/// Top-level module names named by `import` / `from` statements, at any indentation.
///
/// `import a.b, c as d` yields `a` and `c`; relative imports are skipped.
pub fn extract_imports(script: &str) -> Vec<String> {
    let mut found = BTreeSet::new();
    for caps in IMPORT_STMT.captures_iter(script) {
        for part in caps[1].split(',') {
            let root = leading_word(part);
            if is_identifier(root) {
                found.insert(root.to_string());
            }
        }
    }
    for caps in FROM_STMT.captures_iter(script) {
        if is_identifier(&caps[1]) {
            found.insert(caps[1].to_string());
        }
    }
    found.into_iter().collect()
}
