//! Batch front-end for an external shader compiler.
//!
//! Reads a config file listing one compiler invocation per line, expands
//! `{A,B,C}` permutation groups, shells out to the compiler for every
//! permutation, and packs the results for one source/entry into a single
//! permutation blob (see `kiln::permutation`).

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use clap::{Parser, ValueEnum};
use kiln::permutation::BlobWriter;
use kiln::types::ShaderConstant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Platform {
    Dxbc,
    Dxil,
    Spirv,
}

#[derive(Parser, Debug)]
#[command(name = "shader_compiler")]
#[command(about = "Compiles a list of shaders and packs permutations into blobs")]
struct Cli {
    /// Config file with one compiler invocation per line
    #[arg(long)]
    infile: PathBuf,
    /// Output directory for the packed blobs
    #[arg(long)]
    out: PathBuf,
    /// Path to the external compiler executable (fxc or dxc)
    #[arg(long)]
    compiler: PathBuf,
    /// Byte-code flavor to produce
    #[arg(long, value_enum)]
    platform: Platform,
    /// Compile independent outputs on separate threads
    #[arg(long)]
    parallel: bool,
    /// Recompile everything regardless of timestamps
    #[arg(long)]
    force: bool,
    /// Keep the per-permutation intermediate files next to the blobs
    #[arg(long)]
    keep: bool,
    /// Additional include directory, repeatable
    #[arg(short = 'I', value_name = "PATH")]
    include: Vec<PathBuf>,
    /// Additional preprocessor define applied to every shader, repeatable
    #[arg(short = 'D', value_name = "DEF")]
    define: Vec<String>,
    /// HLSL register shift for t registers (SPIR-V only)
    #[arg(long = "vk-t-shift", value_name = "N")]
    vk_t_shift: Option<u32>,
    /// HLSL register shift for s registers (SPIR-V only)
    #[arg(long = "vk-s-shift", value_name = "N")]
    vk_s_shift: Option<u32>,
    /// HLSL register shift for b registers (SPIR-V only)
    #[arg(long = "vk-b-shift", value_name = "N")]
    vk_b_shift: Option<u32>,
    /// HLSL register shift for u registers (SPIR-V only)
    #[arg(long = "vk-u-shift", value_name = "N")]
    vk_u_shift: Option<u32>,
}

/// One compiler invocation after permutation expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CompileTask {
    source: PathBuf,
    target: String,
    entry: String,
    defines: Vec<String>,
}

/// All permutations that share one output blob.
struct OutputGroup {
    source: PathBuf,
    target: String,
    entry: String,
    permutations: Vec<Vec<String>>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), String> {
    let config = fs::read_to_string(&cli.infile)
        .map_err(|err| format!("cannot read {}: {err}", cli.infile.display()))?;
    let config_dir = cli
        .infile
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut tasks = Vec::new();
    for (line_number, line) in config.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("//") {
            continue;
        }
        for expanded in expand_permutations(trimmed) {
            let task = parse_config_line(&expanded).map_err(|err| {
                format!("{}:{}: {err}", cli.infile.display(), line_number + 1)
            })?;
            tasks.push(task);
        }
    }

    let groups = group_tasks(tasks);
    fs::create_dir_all(&cli.out)
        .map_err(|err| format!("cannot create {}: {err}", cli.out.display()))?;

    let failed = AtomicBool::new(false);
    let process = |group: &OutputGroup| {
        if let Err(message) = build_group(cli, &config_dir, group) {
            eprintln!("{}: {message}", group.source.display());
            failed.store(true, Ordering::Relaxed);
        }
    };

    if cli.parallel {
        std::thread::scope(|scope| {
            for group in &groups {
                scope.spawn(|| process(group));
            }
        });
    } else {
        for group in &groups {
            process(group);
        }
    }

    if failed.load(Ordering::Relaxed) {
        Err("one or more shaders failed to compile".into())
    } else {
        Ok(())
    }
}

/// Expands every `{A,B,C}` group in the line into its cartesian product.
fn expand_permutations(line: &str) -> Vec<String> {
    let Some(open) = line.find('{') else {
        return vec![line.to_string()];
    };
    let Some(close_rel) = line[open..].find('}') else {
        return vec![line.to_string()];
    };
    let close = open + close_rel;
    let prefix = &line[..open];
    let suffix = &line[close + 1..];
    let mut expanded = Vec::new();
    for option in line[open + 1..close].split(',') {
        let candidate = format!("{prefix}{}{suffix}", option.trim());
        expanded.extend(expand_permutations(&candidate));
    }
    expanded
}

fn parse_config_line(line: &str) -> Result<CompileTask, String> {
    let mut tokens = line.split_whitespace();
    let source = tokens
        .next()
        .ok_or_else(|| "empty invocation".to_string())?;
    let mut target = None;
    let mut entry = "main".to_string();
    let mut defines = Vec::new();
    while let Some(token) = tokens.next() {
        match token {
            "-T" => {
                target = Some(
                    tokens
                        .next()
                        .ok_or_else(|| "-T requires a profile".to_string())?
                        .to_string(),
                );
            }
            "-E" => {
                entry = tokens
                    .next()
                    .ok_or_else(|| "-E requires an entry point".to_string())?
                    .to_string();
            }
            "-D" => {
                defines.push(
                    tokens
                        .next()
                        .ok_or_else(|| "-D requires a definition".to_string())?
                        .to_string(),
                );
            }
            other if other.starts_with("-D") && other.len() > 2 => {
                defines.push(other[2..].to_string());
            }
            other => return Err(format!("unrecognized token '{other}'")),
        }
    }
    Ok(CompileTask {
        source: PathBuf::from(source),
        target: target.ok_or_else(|| format!("{source}: missing -T <profile>"))?,
        entry,
        defines,
    })
}

fn group_tasks(tasks: Vec<CompileTask>) -> Vec<OutputGroup> {
    let mut groups: Vec<OutputGroup> = Vec::new();
    for task in tasks {
        match groups.iter_mut().find(|group| {
            group.source == task.source && group.target == task.target && group.entry == task.entry
        }) {
            Some(group) => group.permutations.push(task.defines),
            None => groups.push(OutputGroup {
                source: task.source,
                target: task.target,
                entry: task.entry,
                permutations: vec![task.defines],
            }),
        }
    }
    groups
}

fn output_path(cli: &Cli, group: &OutputGroup) -> PathBuf {
    let stem = group
        .source
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "shader".to_string());
    let name = if group.entry == "main" {
        format!("{stem}.bin")
    } else {
        format!("{stem}_{}.bin", group.entry)
    };
    cli.out.join(name)
}

fn build_group(cli: &Cli, config_dir: &Path, group: &OutputGroup) -> Result<(), String> {
    let source = if group.source.is_absolute() {
        group.source.clone()
    } else {
        config_dir.join(&group.source)
    };
    let output = output_path(cli, group);

    if !cli.force && up_to_date(&source, &cli.include, &output) {
        return Ok(());
    }

    let mut writer = BlobWriter::new();
    for (index, defines) in group.permutations.iter().enumerate() {
        let intermediate = output.with_extension(format!("{index}.tmp"));
        compile_permutation(cli, &source, group, defines, &intermediate)?;
        let bytecode = fs::read(&intermediate)
            .map_err(|err| format!("cannot read compiler output: {err}"))?;
        if cli.keep {
            let kept = output.with_extension(format!("{index}.obj"));
            let _ = fs::rename(&intermediate, kept);
        } else {
            let _ = fs::remove_file(&intermediate);
        }
        let constants = defines
            .iter()
            .map(|define| {
                let (name, value) = define.split_once('=').unwrap_or((define.as_str(), "1"));
                ShaderConstant {
                    name: name.to_string(),
                    value: value.to_string(),
                }
            })
            .collect::<Vec<_>>();
        writer.add_permutation(&constants, &bytecode);
    }

    fs::write(&output, writer.finish())
        .map_err(|err| format!("cannot write {}: {err}", output.display()))?;
    println!("{} -> {}", source.display(), output.display());
    Ok(())
}

fn compile_permutation(
    cli: &Cli,
    source: &Path,
    group: &OutputGroup,
    defines: &[String],
    output: &Path,
) -> Result<(), String> {
    let mut command = Command::new(&cli.compiler);
    command.arg("-nologo");
    command.arg("-T").arg(&group.target);
    command.arg("-E").arg(&group.entry);
    for dir in &cli.include {
        command.arg("-I").arg(dir);
    }
    for define in cli.define.iter().chain(defines) {
        command.arg("-D").arg(define);
    }
    if cli.platform == Platform::Spirv {
        command.arg("-spirv");
        for (flag, shift) in [
            ("-fvk-t-shift", cli.vk_t_shift),
            ("-fvk-s-shift", cli.vk_s_shift),
            ("-fvk-b-shift", cli.vk_b_shift),
            ("-fvk-u-shift", cli.vk_u_shift),
        ] {
            if let Some(value) = shift {
                command.arg(flag).arg(value.to_string()).arg("0");
            }
        }
    }
    command.arg("-Fo").arg(output);
    command.arg(source);

    let result = command
        .output()
        .map_err(|err| format!("cannot launch {}: {err}", cli.compiler.display()))?;
    if !result.status.success() {
        let stderr = String::from_utf8_lossy(&result.stderr);
        let stdout = String::from_utf8_lossy(&result.stdout);
        return Err(format!(
            "compiler exited with {}: {}{}",
            result.status, stdout, stderr
        ));
    }
    Ok(())
}

/// True when the output exists and is newer than the source and everything
/// it transitively includes.
fn up_to_date(source: &Path, include_dirs: &[PathBuf], output: &Path) -> bool {
    let Ok(output_meta) = fs::metadata(output) else {
        return false;
    };
    let Ok(output_time) = output_meta.modified() else {
        return false;
    };
    let mut visited = HashSet::new();
    match newest_dependency(source, include_dirs, &mut visited) {
        Some(source_time) => source_time <= output_time,
        // An unreadable dependency forces a rebuild so the compiler reports it.
        None => false,
    }
}

fn newest_dependency(
    path: &Path,
    include_dirs: &[PathBuf],
    visited: &mut HashSet<PathBuf>,
) -> Option<SystemTime> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !visited.insert(canonical) {
        return Some(SystemTime::UNIX_EPOCH);
    }
    let mut newest = fs::metadata(path).ok()?.modified().ok()?;
    let text = fs::read_to_string(path).ok()?;
    let parent = path.parent().map(Path::to_path_buf);
    for line in text.lines() {
        let Some(include) = parse_include(line) else {
            continue;
        };
        let mut resolved = None;
        if let Some(parent) = &parent {
            let candidate = parent.join(include);
            if candidate.exists() {
                resolved = Some(candidate);
            }
        }
        if resolved.is_none() {
            for dir in include_dirs {
                let candidate = dir.join(include);
                if candidate.exists() {
                    resolved = Some(candidate);
                    break;
                }
            }
        }
        if let Some(resolved) = resolved {
            let child = newest_dependency(&resolved, include_dirs, visited)?;
            newest = newest.max(child);
        }
    }
    Some(newest)
}

fn parse_include(line: &str) -> Option<&str> {
    let rest = line.trim_start().strip_prefix("#include")?.trim_start();
    let (open, close) = match rest.chars().next()? {
        '"' => ('"', '"'),
        '<' => ('<', '>'),
        _ => return None,
    };
    let inner = &rest[open.len_utf8()..];
    inner.find(close).map(|end| &inner[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brace_groups_expand_to_the_cartesian_product() {
        let lines = expand_permutations("a.hlsl -T vs_5_0 -D MODE={0,1} -D FAST={ON,OFF}");
        assert_eq!(lines.len(), 4);
        assert!(lines.contains(&"a.hlsl -T vs_5_0 -D MODE=0 -D FAST=ON".to_string()));
        assert!(lines.contains(&"a.hlsl -T vs_5_0 -D MODE=1 -D FAST=OFF".to_string()));
    }

    #[test]
    fn line_without_braces_passes_through() {
        assert_eq!(
            expand_permutations("a.hlsl -T ps_5_0"),
            vec!["a.hlsl -T ps_5_0".to_string()]
        );
    }

    #[test]
    fn config_line_parses_target_entry_and_defines() {
        let task = parse_config_line("shaders/blit.hlsl -T ps_6_0 -E blit_main -D SRGB=1")
            .expect("valid line");
        assert_eq!(task.source, PathBuf::from("shaders/blit.hlsl"));
        assert_eq!(task.target, "ps_6_0");
        assert_eq!(task.entry, "blit_main");
        assert_eq!(task.defines, vec!["SRGB=1".to_string()]);
    }

    #[test]
    fn inline_defines_are_accepted() {
        let task = parse_config_line("a.hlsl -T cs_6_0 -DWIDTH=8").expect("valid line");
        assert_eq!(task.defines, vec!["WIDTH=8".to_string()]);
    }

    #[test]
    fn missing_target_is_an_error() {
        assert!(parse_config_line("a.hlsl -E main").is_err());
    }

    #[test]
    fn permutations_of_one_source_share_a_group() {
        let tasks = vec![
            parse_config_line("a.hlsl -T ps_6_0 -D MODE=0").unwrap(),
            parse_config_line("a.hlsl -T ps_6_0 -D MODE=1").unwrap(),
            parse_config_line("b.hlsl -T ps_6_0").unwrap(),
        ];
        let groups = group_tasks(tasks);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].permutations.len(), 2);
        assert_eq!(groups[1].permutations.len(), 1);
    }

    #[test]
    fn include_directives_parse_both_quote_styles() {
        assert_eq!(parse_include("#include \"common.hlsli\""), Some("common.hlsli"));
        assert_eq!(parse_include("  #include <shared/math.hlsli>"), Some("shared/math.hlsli"));
        assert_eq!(parse_include("int x = 0; // #include nothing"), None);
    }
}
