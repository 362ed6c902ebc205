//! GLSL → SPIR-V compilation
//!
//! Kernel source is handed to an external compiler (glslc preferred,
//! glslangValidator as fallback) over stdin. The resulting SPIR-V is
//! checked for a sane header and cached by the SHA-256 of the exact source
//! text, so recompiling an unchanged kernel never spawns a process.
//!
//! [`inject_defines`] is the only place this crate looks inside kernel
//! source, and it is a plain text splice.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use crate::error::{ComputeError, Result};

/// SPIR-V magic number (little-endian)
pub const SPIRV_MAGIC: u32 = 0x07230203;

/// Insert one `#define` line per entry right after the first `#version`
/// line. Without a (newline-terminated) version line the defines are
/// prepended to the whole source.
pub fn inject_defines<S: AsRef<str>>(source: &str, defines: &[S]) -> String {
    let block: String = defines
        .iter()
        .map(|d| format!("#define {}\n", d.as_ref()))
        .collect();

    let split = source.find("#version").and_then(|start| {
        source[start..].find('\n').map(|nl| start + nl + 1)
    });

    match split {
        Some(at) => {
            let mut out = String::with_capacity(source.len() + block.len());
            out.push_str(&source[..at]);
            out.push_str(&block);
            out.push_str(&source[at..]);
            out
        }
        None => block + source,
    }
}

/// Check SPIR-V header and convert the byte stream to words.
pub fn spirv_words(bytes: &[u8]) -> Result<Vec<u32>> {
    // Header is 5 words = 20 bytes
    if bytes.len() < 20 {
        return Err(ComputeError::Link(format!(
            "SPIR-V too small: {} bytes (minimum 20)",
            bytes.len()
        )));
    }
    if bytes.len() % 4 != 0 {
        return Err(ComputeError::Link(format!(
            "SPIR-V size ({}) not 4-byte aligned",
            bytes.len()
        )));
    }

    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    if words[0] != SPIRV_MAGIC {
        return Err(ComputeError::Link(format!(
            "Invalid SPIR-V magic: 0x{:08x} (expected 0x{:08x})",
            words[0], SPIRV_MAGIC
        )));
    }

    let major = (words[1] >> 16) & 0xFF;
    let minor = (words[1] >> 8) & 0xFF;
    if major != 1 || minor > 6 {
        return Err(ComputeError::Link(format!(
            "Unsupported SPIR-V version: {}.{} (supported: 1.0-1.6)",
            major, minor
        )));
    }

    if words[3] == 0 {
        return Err(ComputeError::Link("SPIR-V bound is 0 (invalid)".to_string()));
    }

    Ok(words)
}

/// Which command-line compiler is in use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlslTool {
    Glslc,
    GlslangValidator,
}

impl GlslTool {
    pub fn name(&self) -> &'static str {
        match self {
            GlslTool::Glslc => "glslc",
            GlslTool::GlslangValidator => "glslangValidator",
        }
    }

    fn from_path(path: &Path) -> Self {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if stem.contains("glslang") {
            GlslTool::GlslangValidator
        } else {
            GlslTool::Glslc
        }
    }
}

fn responds_to_version(program: &Path) -> bool {
    Command::new(program)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

/// Locate a compiler: explicit path first, then glslc, then glslangValidator.
pub fn detect_compiler(explicit: Option<&Path>) -> Result<(GlslTool, PathBuf)> {
    if let Some(path) = explicit {
        if responds_to_version(path) {
            return Ok((GlslTool::from_path(path), path.to_path_buf()));
        }
        return Err(ComputeError::CompilerNotFound(path.display().to_string()));
    }

    for tool in [GlslTool::Glslc, GlslTool::GlslangValidator] {
        let path = PathBuf::from(tool.name());
        if responds_to_version(&path) {
            return Ok((tool, path));
        }
    }

    Err(ComputeError::CompilerNotFound(
        "glslc, glslangValidator".to_string(),
    ))
}

/// External compiler front-end with a content-addressed SPIR-V cache
pub struct ShaderCompiler {
    explicit: Option<PathBuf>,
    tool: Option<(GlslTool, PathBuf)>,
    target_env: String,
    cache: HashMap<[u8; 32], Arc<[u32]>>,
}

impl ShaderCompiler {
    /// `vulkan_minor` selects `--target-env=vulkan1.<minor>` (clamped to 1.3).
    pub fn new(explicit: Option<PathBuf>, vulkan_minor: u32) -> Self {
        Self {
            explicit,
            tool: None,
            target_env: format!("vulkan1.{}", vulkan_minor.min(3)),
            cache: HashMap::new(),
        }
    }

    /// Compiler in use, detecting it on first call.
    pub fn tool(&mut self) -> Result<(GlslTool, &Path)> {
        if self.tool.is_none() {
            let found = detect_compiler(self.explicit.as_deref())?;
            log::info!("Using GLSL compiler {} ({})", found.0.name(), found.1.display());
            self.tool = Some(found);
        }
        match &self.tool {
            Some((tool, path)) => Ok((*tool, path.as_path())),
            None => Err(ComputeError::CompilerNotFound("glslc, glslangValidator".into())),
        }
    }

    fn cache_key(&self, source: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.target_env.as_bytes());
        hasher.update([0u8]);
        hasher.update(source.as_bytes());
        hasher.finalize().into()
    }

    pub fn is_cached(&self, source: &str) -> bool {
        self.cache.contains_key(&self.cache_key(source))
    }

    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    /// Compile compute-stage GLSL to validated SPIR-V words.
    pub fn compile(&mut self, source: &str) -> Result<Arc<[u32]>> {
        let key = self.cache_key(source);
        if let Some(words) = self.cache.get(&key) {
            log::debug!("SPIR-V cache hit ({} words)", words.len());
            return Ok(words.clone());
        }

        let target_env = self.target_env.clone();
        let (tool, path) = self.tool()?;
        let bytes = match tool {
            GlslTool::Glslc => run_glslc(path, &target_env, source)?,
            GlslTool::GlslangValidator => run_glslang(path, &target_env, source)?,
        };

        let words: Arc<[u32]> = spirv_words(&bytes)?.into();
        log::debug!("Compiled compute shader: {} SPIR-V words", words.len());
        self.cache.insert(key, words.clone());
        Ok(words)
    }
}

fn run_with_stdin(mut command: Command, tool: GlslTool, source: &str) -> Result<std::process::Output> {
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| ComputeError::CompilerNotFound(format!("{} ({})", tool.name(), e)))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(source.as_bytes()).map_err(|e| {
            ComputeError::Compilation(format!("Failed to feed source to {}: {}", tool.name(), e))
        })?;
    }

    child.wait_with_output().map_err(|e| {
        ComputeError::Compilation(format!("Failed to run {}: {}", tool.name(), e))
    })
}

fn compiler_log(output: &std::process::Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stderr.trim().is_empty() {
        stderr.into_owned()
    } else if !stdout.trim().is_empty() {
        stdout.into_owned()
    } else {
        format!("Compilation failed with exit code: {:?}", output.status.code())
    }
}

fn run_glslc(path: &Path, target_env: &str, source: &str) -> Result<Vec<u8>> {
    let mut command = Command::new(path);
    command
        .arg("-fshader-stage=compute")
        .arg(format!("--target-env={}", target_env))
        .arg("-o")
        .arg("-")
        .arg("-");

    let output = run_with_stdin(command, GlslTool::Glslc, source)?;
    if !output.status.success() {
        return Err(ComputeError::Compilation(compiler_log(&output)));
    }
    Ok(output.stdout)
}

fn run_glslang(path: &Path, target_env: &str, source: &str) -> Result<Vec<u8>> {
    // glslangValidator cannot write SPIR-V to stdout
    let out_file = tempfile::Builder::new()
        .prefix("hlx-compute-")
        .suffix(".spv")
        .tempfile()
        .map_err(|e| ComputeError::Compilation(format!("Failed to create temp file: {}", e)))?;

    let mut command = Command::new(path);
    command
        .arg("-V")
        .arg("--target-env")
        .arg(target_env)
        .arg("--stdin")
        .arg("-S")
        .arg("comp")
        .arg("-o")
        .arg(out_file.path());

    let output = run_with_stdin(command, GlslTool::GlslangValidator, source)?;
    if !output.status.success() {
        return Err(ComputeError::Compilation(compiler_log(&output)));
    }

    std::fs::read(out_file.path()).map_err(|source| ComputeError::Io {
        action: "read",
        path: out_file.path().to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: &str = "#version 450\nlayout(local_size_x = 1) in;\nvoid main() {}\n";

    #[test]
    fn test_defines_after_version_line() {
        let out = inject_defines(SRC, &["FOO", "BAR 3"]);
        assert_eq!(
            out,
            "#version 450\n#define FOO\n#define BAR 3\nlayout(local_size_x = 1) in;\nvoid main() {}\n"
        );
    }

    #[test]
    fn test_defines_prepended_without_version() {
        let out = inject_defines("void main() {}\n", &["FOO"]);
        assert_eq!(out, "#define FOO\nvoid main() {}\n");
    }

    #[test]
    fn test_defines_prepended_when_version_line_unterminated() {
        let out = inject_defines("#version 450", &["FOO"]);
        assert_eq!(out, "#define FOO\n#version 450");
    }

    #[test]
    fn test_defines_use_first_version_line() {
        let src = "// header\n#version 450\nfoo\n#version 460\n";
        let out = inject_defines(src, &["X"]);
        assert_eq!(out, "// header\n#version 450\n#define X\nfoo\n#version 460\n");
    }

    #[test]
    fn test_no_defines_is_identity() {
        let none: [&str; 0] = [];
        assert_eq!(inject_defines(SRC, &none), SRC);
    }

    fn header(version: u32, bound: u32) -> Vec<u8> {
        [SPIRV_MAGIC, version, 0, bound, 0]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect()
    }

    #[test]
    fn test_spirv_words_accepts_valid_header() {
        let words = spirv_words(&header(0x0001_0300, 8)).unwrap();
        assert_eq!(words.len(), 5);
        assert_eq!(words[0], SPIRV_MAGIC);
    }

    #[test]
    fn test_spirv_words_rejects_bad_input() {
        assert!(matches!(spirv_words(&[0u8; 8]), Err(ComputeError::Link(_))));
        assert!(matches!(spirv_words(&[0u8; 21]), Err(ComputeError::Link(_))));

        let mut bad_magic = header(0x0001_0000, 8);
        bad_magic[0] = 0xFF;
        assert!(spirv_words(&bad_magic).is_err());

        assert!(spirv_words(&header(0x0002_0000, 8)).is_err());
        assert!(spirv_words(&header(0x0001_0000, 0)).is_err());
    }

    #[test]
    fn test_tool_from_path() {
        assert_eq!(GlslTool::from_path(Path::new("/usr/bin/glslc")), GlslTool::Glslc);
        assert_eq!(
            GlslTool::from_path(Path::new("/opt/sdk/glslangValidator")),
            GlslTool::GlslangValidator
        );
    }

    #[test]
    fn test_cache_key_depends_on_source_and_target() {
        let a = ShaderCompiler::new(None, 2);
        let b = ShaderCompiler::new(None, 3);
        assert_eq!(a.cache_key(SRC), a.cache_key(SRC));
        assert_ne!(a.cache_key(SRC), a.cache_key("void main() {}"));
        assert_ne!(a.cache_key(SRC), b.cache_key(SRC));
        assert!(!a.is_cached(SRC));
        assert_eq!(a.cached_count(), 0);
    }

    #[test]
    fn test_missing_explicit_compiler() {
        let err = detect_compiler(Some(Path::new("/nonexistent/glslc-hlx"))).unwrap_err();
        assert!(matches!(err, ComputeError::CompilerNotFound(_)));
    }
}
