//! hlx-compute - command line front-end
//!
//! Inspect the device, check the GLSL toolchain, or run a single compute
//! kernel over a zero-filled buffer bound to slot 0.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use hlx_compute::shader::detect_compiler;
use hlx_compute::{ComputeContext, ComputeError, ContextConfig, TRACE_TARGET};

/// Number of 32-bit words printed after `run`
const PREVIEW_WORDS: usize = 16;

#[derive(Parser)]
#[command(name = "hlx-compute")]
#[command(version)]
#[command(about = "Run GLSL compute kernels on a Vulkan device")]
struct Cli {
    /// Minimum Vulkan version as MAJOR.MINOR
    #[arg(long, default_value = "1.2", value_parser = parse_version, global = true)]
    vulkan: (u32, u32),

    /// Print per-operation traces
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the device's compute limits
    Limits {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Check which GLSL compiler is available
    CheckCompiler,
    /// Compile and dispatch a kernel, then print the start of slot 0
    Run {
        /// Path to the GLSL compute shader
        shader: PathBuf,

        /// Work groups as X[,Y[,Z]]
        #[arg(long, value_parser = parse_groups, default_value = "1")]
        groups: [u32; 3],

        /// Size in bytes of the buffer bound to slot 0
        #[arg(long, default_value_t = 1024)]
        buffer_size: u64,

        /// Preprocessor define, e.g. `--define "SCALE 2"` (repeatable)
        #[arg(short = 'D', long = "define")]
        defines: Vec<String>,

        /// Report GPU time of the dispatch
        #[arg(long)]
        time: bool,
    },
}

fn parse_version(s: &str) -> Result<(u32, u32), String> {
    let (major, minor) = s
        .split_once('.')
        .ok_or_else(|| format!("expected MAJOR.MINOR, got '{}'", s))?;
    let major = major.trim().parse().map_err(|e| format!("bad major version: {}", e))?;
    let minor = minor.trim().parse().map_err(|e| format!("bad minor version: {}", e))?;
    Ok((major, minor))
}

fn parse_groups(s: &str) -> Result<[u32; 3], String> {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.is_empty() || parts.len() > 3 {
        return Err(format!("expected X[,Y[,Z]], got '{}'", s));
    }
    let mut groups = [1u32; 3];
    for (slot, part) in groups.iter_mut().zip(&parts) {
        *slot = part
            .trim()
            .parse()
            .map_err(|e| format!("bad group count '{}': {}", part, e))?;
    }
    Ok(groups)
}

fn config(debug: bool) -> ContextConfig {
    let mut config = ContextConfig::from_env();
    config.debug |= debug;
    config
}

fn limits(cli: &Cli, json: bool) -> Result<(), ComputeError> {
    let ctx = ComputeContext::init_with_config(cli.vulkan.0, cli.vulkan.1, config(cli.debug))?;
    let limits = ctx.limits();

    if json {
        let text = serde_json::to_string_pretty(&limits)
            .map_err(|e| ComputeError::InvalidArgument(format!("JSON encoding failed: {}", e)))?;
        println!("{}", text);
        return Ok(());
    }

    let (major, minor) = ctx.api_version();
    println!("Device:                 {}", ctx.device_name());
    println!("Vulkan:                 {}.{}", major, minor);
    println!(
        "Max group count:        {} x {} x {}",
        limits.max_group_count[0], limits.max_group_count[1], limits.max_group_count[2]
    );
    println!(
        "Max group size:         {} x {} x {}",
        limits.max_group_size[0], limits.max_group_size[1], limits.max_group_size[2]
    );
    println!("Max invocations/group:  {}", limits.max_invocations_per_group);
    Ok(())
}

fn check_compiler() -> Result<(), ComputeError> {
    let explicit = ContextConfig::from_env().compiler;
    let (tool, path) = detect_compiler(explicit.as_deref())?;
    println!("{} ({})", tool.name(), path.display());
    Ok(())
}

fn run(
    cli: &Cli,
    shader: &Path,
    groups: [u32; 3],
    buffer_size: u64,
    defines: &[String],
    time: bool,
) -> Result<(), ComputeError> {
    let mut ctx = ComputeContext::init_with_config(cli.vulkan.0, cli.vulkan.1, config(cli.debug))?;

    let source = std::fs::read_to_string(shader).map_err(|source| ComputeError::Io {
        action: "read",
        path: shader.to_path_buf(),
        source,
    })?;
    let program = ctx.compile_with_defines(&source, defines)?;
    eprintln!(
        "Compiled {} (local size {:?})",
        shader.display(),
        program.local_size()
    );
    ctx.set_program(program)?;

    let buffer = ctx.create_buffer_zeroed(buffer_size)?;
    ctx.bind_buffer(&buffer, 0)?;

    if time {
        ctx.begin_timing()?;
    }
    ctx.dispatch(groups[0], groups[1], groups[2])?;
    if time {
        let ms = ctx.end_timing()?;
        eprintln!("GPU time: {:.3} ms", ms);
    }

    let words = (buffer_size as usize / 4).min(PREVIEW_WORDS);
    if words == 0 {
        return Ok(());
    }
    let values: Vec<u32> = ctx.read_buffer_as(&buffer, words)?;
    for (i, value) in values.iter().enumerate() {
        println!(
            "[{:2}] {:#010x}  u32={:<10}  f32={}",
            i,
            value,
            value,
            f32::from_bits(*value)
        );
    }
    Ok(())
}

/// Warnings by default; `--debug` also shows the per-operation traces.
fn logger(debug: bool) -> env_logger::Builder {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if debug {
        builder.filter_module(TRACE_TARGET, log::LevelFilter::Info);
    }
    builder
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logger(cli.debug).init();

    let result = match &cli.command {
        Commands::Limits { json } => limits(&cli, *json),
        Commands::CheckCompiler => check_compiler(),
        Commands::Run {
            shader,
            groups,
            buffer_size,
            defines,
            time,
        } => run(&cli, shader, *groups, *buffer_size, defines, *time),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(ComputeError::CompilerNotFound(tried)) => {
            eprintln!("ERROR: No GLSL compiler found (tried {})", tried);
            eprintln!("Install with:");
            eprintln!("  Arch Linux: sudo pacman -S shaderc");
            eprintln!("  Ubuntu: sudo apt install glslc");
            eprintln!("  macOS: brew install shaderc");
            eprintln!("or point HLX_GLSLC at a compiler binary");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("ERROR: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_groups() {
        assert_eq!(parse_groups("8").unwrap(), [8, 1, 1]);
        assert_eq!(parse_groups("8,4").unwrap(), [8, 4, 1]);
        assert_eq!(parse_groups("8, 4, 2").unwrap(), [8, 4, 2]);
        assert!(parse_groups("1,2,3,4").is_err());
        assert!(parse_groups("x").is_err());
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("1.3").unwrap(), (1, 3));
        assert!(parse_version("1").is_err());
        assert!(parse_version("a.b").is_err());
    }

    #[test]
    fn test_debug_flag_shows_traces() {
        use log::Log;

        let trace = log::Metadata::builder()
            .target(TRACE_TARGET)
            .level(log::Level::Info)
            .build();
        assert!(logger(true).build().enabled(&trace));
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "hlx-compute",
            "run",
            "k.comp",
            "--groups",
            "4,2",
            "-D",
            "FOO",
            "--define",
            "BAR 3",
            "--time",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                groups,
                defines,
                time,
                buffer_size,
                ..
            } => {
                assert_eq!(groups, [4, 2, 1]);
                assert_eq!(defines, vec!["FOO", "BAR 3"]);
                assert!(time);
                assert_eq!(buffer_size, 1024);
            }
            _ => panic!("expected run"),
        }
        assert_eq!(cli.vulkan, (1, 2));
    }
}
