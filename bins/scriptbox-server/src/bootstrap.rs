// Sandbox bootstrap script
// Rendered per job into run.sh; the sandbox command is `sh /app/run.sh`

/// Import name -> pip package, for best-effort installs
const PACKAGE_MAP: &[(&str, &str)] = &[
    ("tensorflow", "tensorflow"),
    ("torch", "torch"),
    ("keras", "keras"),
    ("numpy", "numpy"),
    ("pandas", "pandas"),
    ("matplotlib", "matplotlib"),
    ("sklearn", "scikit-learn"),
    ("scipy", "scipy"),
    ("cv2", "opencv-python"),
    ("PIL", "Pillow"),
    ("requests", "requests"),
    ("flask", "flask"),
    ("django", "django"),
];

const GPU_TENSORFLOW: &str = "tensorflow>=2.15.0";
const GPU_CUDNN: &str = "nvidia-cudnn-cu12>=8.9";

fn is_tensorflow_image(image: &str) -> bool {
    image.contains("tensorflow/tensorflow")
}

/// Packages to install for a set of imported module names.
///
/// A tensorflow GPU image already ships tensorflow, so it is skipped there.
/// Other GPU images get a CUDA-enabled tensorflow plus cuDNN.
pub fn packages_for(imports: &[String], use_gpu: bool, gpu_image: &str) -> Vec<String> {
    let mut packages = Vec::new();
    for (module, package) in PACKAGE_MAP {
        if !imports.iter().any(|i| i == module) {
            continue;
        }
        if *module == "tensorflow" && use_gpu {
            if is_tensorflow_image(gpu_image) {
                continue;
            }
            packages.push(GPU_TENSORFLOW.to_string());
            packages.push(GPU_CUDNN.to_string());
            continue;
        }
        packages.push(package.to_string());
    }
    packages
}

pub fn render_run_script(imports: &[String], use_gpu: bool, gpu_image: &str) -> String {
    let mut script = String::from(
        r#"#!/bin/sh
if command -v python3 >/dev/null 2>&1; then
    PYTHON_CMD=python3
elif command -v python >/dev/null 2>&1; then
    PYTHON_CMD=python
else
    echo "scriptbox: no python interpreter found in image" >&2
    exit 127
fi
PIP_CMD="$PYTHON_CMD -m pip"

$PIP_CMD install --upgrade pip --quiet --disable-pip-version-check >/dev/null 2>&1 || true
"#,
    );

    let packages = packages_for(imports, use_gpu, gpu_image);
    if !packages.is_empty() {
        script.push_str(&format!(
            "$PIP_CMD install --quiet --disable-pip-version-check {} >/dev/null 2>&1 || true\n",
            packages.join(" ")
        ));
    }

    if use_gpu {
        script.push_str("export TF_CPP_MIN_LOG_LEVEL=1\n");
        script.push_str("export TF_FORCE_GPU_ALLOW_GROWTH=true\n");
    }

    script.push_str(
        r#"export PYTHONUNBUFFERED=1
mkdir -p /app/output
cd /app/output
exec $PYTHON_CMD /app/script.py
"#,
    );
    script
}
