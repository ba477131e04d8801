//! Buildfile parsing and image building.
//!
//! A Buildfile is newline-separated instructions (`#` comments, backslash
//! continuations). Metadata instructions mutate the in-progress runtime
//! defaults; `FROM`, `RUN`, `COPY` and `ADD` contribute layers. Layer
//! tarballs are normalized (sorted entries, zeroed timestamps) so the same
//! context and instructions always produce the same image id.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use walkdir::WalkDir;

use crate::errors::{ServinError, ServinResult};
use crate::images::layers::{WHITEOUT_PREFIX, apply_layer_tar, pack_layer};
use crate::images::store::ImageStore;
use crate::images::types::{ImageConfigBlob, ImageManifest, ImageRecord, RuntimeDefaults};

/// One parsed Buildfile instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildInstruction {
    From(String),
    Run(String),
    Copy { sources: Vec<String>, dest: String },
    Add { sources: Vec<String>, dest: String },
    Workdir(String),
    Env(Vec<(String, String)>),
    Expose(Vec<String>),
    Cmd(Vec<String>),
    Entrypoint(Vec<String>),
    Label(Vec<(String, String)>),
    User(String),
    Volume(Vec<String>),
    Arg { name: String, default: Option<String> },
}

/// Options controlling a build.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// File name inside the context directory; defaults to `Buildfile`.
    pub buildfile_name: Option<String>,
    pub build_args: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    /// Tag applied to the result.
    pub tag: Option<String>,
}

// ----------------------------------------------------------------------
// Parsing
// ----------------------------------------------------------------------

/// Parse the full text of a Buildfile.
pub fn parse_buildfile(text: &str) -> ServinResult<Vec<BuildInstruction>> {
    let mut instructions = Vec::new();
    let mut pending = String::new();

    for raw_line in text.lines() {
        let line = raw_line.trim_end();
        if pending.is_empty() {
            let trimmed = line.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
        }
        if let Some(stripped) = line.strip_suffix('\\') {
            pending.push_str(stripped);
            pending.push(' ');
            continue;
        }
        pending.push_str(line);
        let logical = std::mem::take(&mut pending);
        instructions.push(parse_instruction(logical.trim())?);
    }
    if !pending.is_empty() {
        instructions.push(parse_instruction(pending.trim())?);
    }
    Ok(instructions)
}

fn parse_instruction(line: &str) -> ServinResult<BuildInstruction> {
    let (keyword, rest) = match line.split_once(char::is_whitespace) {
        Some((k, r)) => (k, r.trim()),
        None => (line, ""),
    };

    let require_args = |rest: &str| -> ServinResult<()> {
        if rest.is_empty() {
            Err(ServinError::InvalidConfig(format!(
                "{keyword} requires arguments"
            )))
        } else {
            Ok(())
        }
    };

    match keyword.to_ascii_uppercase().as_str() {
        "FROM" => {
            require_args(rest)?;
            Ok(BuildInstruction::From(rest.to_string()))
        }
        "RUN" => {
            require_args(rest)?;
            Ok(BuildInstruction::Run(rest.to_string()))
        }
        "COPY" | "ADD" => {
            let mut parts = split_quoted(rest)?;
            if parts.len() < 2 {
                return Err(ServinError::InvalidConfig(format!(
                    "{keyword} needs at least a source and a destination"
                )));
            }
            let dest = parts.pop().unwrap_or_default();
            if keyword.eq_ignore_ascii_case("COPY") {
                Ok(BuildInstruction::Copy {
                    sources: parts,
                    dest,
                })
            } else {
                Ok(BuildInstruction::Add {
                    sources: parts,
                    dest,
                })
            }
        }
        "WORKDIR" => {
            require_args(rest)?;
            Ok(BuildInstruction::Workdir(rest.to_string()))
        }
        "ENV" => Ok(BuildInstruction::Env(parse_key_values(rest)?)),
        "EXPOSE" => {
            require_args(rest)?;
            Ok(BuildInstruction::Expose(
                rest.split_whitespace().map(str::to_string).collect(),
            ))
        }
        "CMD" => Ok(BuildInstruction::Cmd(parse_command_form(rest)?)),
        "ENTRYPOINT" => Ok(BuildInstruction::Entrypoint(parse_command_form(rest)?)),
        "LABEL" => Ok(BuildInstruction::Label(parse_key_values(rest)?)),
        "USER" => {
            require_args(rest)?;
            Ok(BuildInstruction::User(rest.to_string()))
        }
        "VOLUME" => {
            require_args(rest)?;
            let paths = if rest.starts_with('[') {
                parse_json_array(rest)?
            } else {
                rest.split_whitespace().map(str::to_string).collect()
            };
            Ok(BuildInstruction::Volume(paths))
        }
        "ARG" => {
            require_args(rest)?;
            let (name, default) = match rest.split_once('=') {
                Some((n, d)) => (n.trim().to_string(), Some(d.trim().to_string())),
                None => (rest.to_string(), None),
            };
            Ok(BuildInstruction::Arg { name, default })
        }
        other => Err(ServinError::InvalidConfig(format!(
            "unknown instruction: {other}"
        ))),
    }
}

/// `CMD`/`ENTRYPOINT` accept a JSON array (exec form) or a shell string.
fn parse_command_form(rest: &str) -> ServinResult<Vec<String>> {
    if rest.starts_with('[') {
        parse_json_array(rest)
    } else if rest.is_empty() {
        Ok(Vec::new())
    } else {
        Ok(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            rest.to_string(),
        ])
    }
}

fn parse_json_array(rest: &str) -> ServinResult<Vec<String>> {
    serde_json::from_str(rest)
        .map_err(|e| ServinError::InvalidConfig(format!("invalid JSON array {rest:?}: {e}")))
}

/// Parse `KEY=VALUE [KEY=VALUE...]` or the legacy `KEY the rest is the value`
/// form. Values may be double-quoted.
fn parse_key_values(rest: &str) -> ServinResult<Vec<(String, String)>> {
    let rest = rest.trim();
    if rest.is_empty() {
        return Err(ServinError::InvalidConfig("missing key/value".into()));
    }

    let tokens = split_quoted(rest)?;
    let first_has_eq = tokens.first().is_some_and(|t| t.contains('='));

    if first_has_eq {
        tokens
            .iter()
            .map(|token| {
                token
                    .split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .ok_or_else(|| {
                        ServinError::InvalidConfig(format!("expected KEY=VALUE, got {token:?}"))
                    })
            })
            .collect()
    } else {
        // `KEY VALUE` form: everything after the key is the value.
        let (key, value) = rest
            .split_once(char::is_whitespace)
            .ok_or_else(|| ServinError::InvalidConfig(format!("{rest:?} has no value")))?;
        Ok(vec![(key.to_string(), value.trim().to_string())])
    }
}

/// Split on whitespace, honouring double quotes.
fn split_quoted(s: &str) -> ServinResult<Vec<String>> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in s.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if in_quotes {
        return Err(ServinError::InvalidConfig(format!(
            "unterminated quote in {s:?}"
        )));
    }
    if !current.is_empty() {
        out.push(current);
    }
    Ok(out)
}

/// Substitute `${NAME}` and `$NAME` using declared build args.
fn substitute_args(input: &str, args: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let braced = chars.peek() == Some(&'{');
        if braced {
            chars.next();
        }
        let mut name = String::new();
        while let Some(&next) = chars.peek() {
            if next.is_ascii_alphanumeric() || next == '_' {
                name.push(next);
                chars.next();
            } else {
                break;
            }
        }
        if braced && chars.peek() == Some(&'}') {
            chars.next();
        }
        match args.get(&name) {
            Some(value) => out.push_str(value),
            None => {
                out.push('$');
                out.push_str(&name);
            }
        }
    }
    out
}

// ----------------------------------------------------------------------
// Execution
// ----------------------------------------------------------------------

struct BuildState {
    rootfs: PathBuf,
    defaults: RuntimeDefaults,
    layers: Vec<String>,
    total_size: u64,
    workdir: String,
    args: BTreeMap<String, String>,
}

impl ImageStore {
    /// Build an image from a context directory and its Buildfile.
    pub fn build(&self, context_dir: &Path, options: &BuildOptions) -> ServinResult<ImageRecord> {
        let buildfile = context_dir.join(
            options
                .buildfile_name
                .as_deref()
                .unwrap_or("Buildfile"),
        );
        let text = std::fs::read_to_string(&buildfile).map_err(|e| {
            ServinError::InvalidConfig(format!("cannot read {}: {e}", buildfile.display()))
        })?;
        let instructions = parse_buildfile(&text)?;
        if !matches!(
            instructions.iter().find(|i| !matches!(i, BuildInstruction::Arg { .. })),
            Some(BuildInstruction::From(_))
        ) {
            return Err(ServinError::InvalidConfig(
                "the first instruction must be FROM".into(),
            ));
        }

        let staging = tempfile::tempdir()
            .map_err(|e| ServinError::Storage(format!("build staging dir: {e}")))?;
        let mut state = BuildState {
            rootfs: staging.path().join("rootfs"),
            defaults: RuntimeDefaults::default(),
            layers: Vec::new(),
            total_size: 0,
            workdir: "/".to_string(),
            args: BTreeMap::new(),
        };
        std::fs::create_dir_all(&state.rootfs)?;

        for instruction in &instructions {
            self.execute(instruction, &mut state, context_dir, options)?;
        }

        for (key, value) in &options.labels {
            state.defaults.labels.insert(key.clone(), value.clone());
        }

        let config_bytes = serde_json::to_vec(&ImageConfigBlob::new(state.defaults.clone()))?;
        let config_digest = self.put_blob(&config_bytes)?;
        let manifest = ImageManifest::new(config_digest, state.layers.clone());

        let tags: Vec<String> = options.tag.iter().cloned().collect();
        self.register_image(&manifest, state.total_size, &tags)
    }

    fn execute(
        &self,
        instruction: &BuildInstruction,
        state: &mut BuildState,
        context_dir: &Path,
        options: &BuildOptions,
    ) -> ServinResult<()> {
        match instruction {
            BuildInstruction::Arg { name, default } => {
                let value = options
                    .build_args
                    .get(name)
                    .cloned()
                    .or_else(|| default.clone())
                    .unwrap_or_default();
                state.args.insert(name.clone(), value);
            }
            BuildInstruction::From(image) => {
                let image = substitute_args(image, &state.args);
                if image != "scratch" {
                    let base = self.inspect(&image)?;
                    let manifest = self.load_manifest(&base.id)?;
                    for layer in &manifest.layers {
                        apply_layer_tar(&self.read_blob(layer)?, &state.rootfs)?;
                        state.total_size += self
                            .blob_path(layer)
                            .metadata()
                            .map(|m| m.len())
                            .unwrap_or(0);
                    }
                    state.layers = manifest.layers;
                    state.defaults = base.config;
                    if !state.defaults.working_dir.is_empty() {
                        state.workdir = state.defaults.working_dir.clone();
                    }
                }
            }
            BuildInstruction::Run(cmd) => {
                let cmd = substitute_args(cmd, &state.args);
                let before = snapshot_tree(&state.rootfs);
                run_in_rootfs(&state.rootfs, &state.workdir, &state.defaults, &cmd)?;
                let layer = diff_layer(&state.rootfs, &before)?;
                self.push_layer(state, layer)?;
            }
            BuildInstruction::Copy { sources, dest } | BuildInstruction::Add { sources, dest } => {
                let is_add = matches!(instruction, BuildInstruction::Add { .. });
                let dest = substitute_args(dest, &state.args);
                let mut copied = Vec::new();
                for source in sources {
                    let source = substitute_args(source, &state.args);
                    copy_into_rootfs(
                        context_dir,
                        &source,
                        &state.rootfs,
                        &state.workdir,
                        &dest,
                        is_add,
                        &mut copied,
                    )?;
                }
                let layer = pack_layer(&state.rootfs, copied)?;
                self.push_layer(state, layer)?;
            }
            BuildInstruction::Workdir(dir) => {
                let dir = substitute_args(dir, &state.args);
                let absolute = resolve_in_container(&state.workdir, &dir);
                std::fs::create_dir_all(join_container_path(&state.rootfs, &absolute))?;
                state.workdir = absolute.clone();
                state.defaults.working_dir = absolute;
            }
            BuildInstruction::Env(pairs) => {
                for (key, value) in pairs {
                    let value = substitute_args(value, &state.args);
                    state.defaults.env_set(key, &value);
                    // ENV values also feed later substitutions.
                    state.args.insert(key.clone(), value);
                }
            }
            BuildInstruction::Expose(ports) => {
                for port in ports {
                    let key = if port.contains('/') {
                        port.clone()
                    } else {
                        format!("{port}/tcp")
                    };
                    state
                        .defaults
                        .exposed_ports
                        .insert(key, serde_json::json!({}));
                }
            }
            BuildInstruction::Cmd(argv) => {
                state.defaults.cmd =
                    argv.iter().map(|a| substitute_args(a, &state.args)).collect();
            }
            BuildInstruction::Entrypoint(argv) => {
                state.defaults.entrypoint =
                    argv.iter().map(|a| substitute_args(a, &state.args)).collect();
            }
            BuildInstruction::Label(pairs) => {
                for (key, value) in pairs {
                    state
                        .defaults
                        .labels
                        .insert(key.clone(), substitute_args(value, &state.args));
                }
            }
            BuildInstruction::User(user) => {
                state.defaults.user = substitute_args(user, &state.args);
            }
            BuildInstruction::Volume(paths) => {
                for path in paths {
                    state
                        .defaults
                        .volumes
                        .insert(path.clone(), serde_json::json!({}));
                }
            }
        }
        Ok(())
    }

    fn push_layer(&self, state: &mut BuildState, layer: Vec<u8>) -> ServinResult<()> {
        if layer_is_empty(&layer) {
            return Ok(());
        }
        state.total_size += layer.len() as u64;
        let digest = self.put_blob(&layer)?;
        state.layers.push(digest);
        Ok(())
    }
}

/// A tar with no entries is ~1 KiB of zero padding; skip it.
fn layer_is_empty(layer: &[u8]) -> bool {
    layer.iter().all(|&b| b == 0)
}

fn resolve_in_container(workdir: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else if workdir.ends_with('/') {
        format!("{workdir}{path}")
    } else {
        format!("{workdir}/{path}")
    }
}

fn join_container_path(rootfs: &Path, container_path: &str) -> PathBuf {
    rootfs.join(container_path.trim_start_matches('/'))
}

/// Run a shell command chroot-ed into the staged rootfs.
fn run_in_rootfs(
    rootfs: &Path,
    workdir: &str,
    defaults: &RuntimeDefaults,
    cmd: &str,
) -> ServinResult<()> {
    let mut command = Command::new("chroot");
    command
        .arg(rootfs)
        .arg("/bin/sh")
        .arg("-c")
        .arg(format!("cd {workdir} && {cmd}"))
        .env_clear()
        .env("PATH", "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin");
    for entry in &defaults.env {
        if let Some((key, value)) = entry.split_once('=') {
            command.env(key, value);
        }
    }

    let output = command
        .output()
        .map_err(|e| ServinError::Isolation(format!("chroot for RUN failed: {e}")))?;
    if !output.status.success() {
        return Err(ServinError::ExecFailed(format!(
            "RUN {cmd:?} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

type TreeSnapshot = BTreeMap<PathBuf, (u64, i64)>;

/// Record (size, mtime) per path so a post-RUN diff can identify the layer.
fn snapshot_tree(root: &Path) -> TreeSnapshot {
    let mut snapshot = BTreeMap::new();
    for entry in WalkDir::new(root).min_depth(1).into_iter().flatten() {
        let rel = match entry.path().strip_prefix(root) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => continue,
        };
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(_) => continue,
        };
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        snapshot.insert(rel, (meta.len(), mtime));
    }
    snapshot
}

/// Build a layer tar containing everything added or changed since `before`,
/// plus whiteouts for everything removed.
fn diff_layer(root: &Path, before: &TreeSnapshot) -> ServinResult<Vec<u8>> {
    let after = snapshot_tree(root);

    let mut changed: Vec<PathBuf> = after
        .iter()
        .filter(|(path, stamp)| before.get(*path) != Some(stamp))
        .map(|(path, _)| path.clone())
        .collect();

    // Whiteouts are materialized in a scratch dir so pack_layer can pick them
    // up alongside the changed files.
    let removed: Vec<&PathBuf> = before.keys().filter(|p| !after.contains_key(*p)).collect();
    if removed.is_empty() {
        return pack_layer(root, changed);
    }

    let scratch = tempfile::tempdir()
        .map_err(|e| ServinError::Storage(format!("diff staging: {e}")))?;
    let mut extra = Vec::new();
    for path in removed {
        let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        let marker = path
            .parent()
            .unwrap_or(Path::new(""))
            .join(format!("{WHITEOUT_PREFIX}{name}"));
        let staged = scratch.path().join(&marker);
        if let Some(parent) = staged.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&staged, b"")?;
        extra.push(marker);
    }

    let mut content = pack_layer(root, changed)?;
    let whiteouts = pack_layer(scratch.path(), extra)?;
    // Concatenating two tars is valid as long as the first one's trailing
    // zero blocks (exactly two, as written by the builder) are stripped.
    strip_tar_trailer(&mut content);
    content.extend_from_slice(&whiteouts);
    Ok(content)
}

fn strip_tar_trailer(tar_bytes: &mut Vec<u8>) {
    for _ in 0..2 {
        if tar_bytes.len() >= 512 && tar_bytes[tar_bytes.len() - 512..].iter().all(|&b| b == 0) {
            let new_len = tar_bytes.len() - 512;
            tar_bytes.truncate(new_len);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn copy_into_rootfs(
    context_dir: &Path,
    source: &str,
    rootfs: &Path,
    workdir: &str,
    dest: &str,
    extract_archives: bool,
    copied: &mut Vec<PathBuf>,
) -> ServinResult<()> {
    let source_path = context_dir.join(source);
    let canonical_context = context_dir
        .canonicalize()
        .map_err(|e| ServinError::InvalidConfig(format!("bad context dir: {e}")))?;
    let canonical_source = source_path.canonicalize().map_err(|_| {
        ServinError::InvalidConfig(format!("source {source:?} not found in context"))
    })?;
    if !canonical_source.starts_with(&canonical_context) {
        return Err(ServinError::InvalidConfig(format!(
            "source {source:?} escapes the build context"
        )));
    }

    let dest_abs = resolve_in_container(workdir, dest);
    let dest_is_dir = dest.ends_with('/') || canonical_source.is_dir();

    if extract_archives && is_archive(&canonical_source) {
        let target_dir = join_container_path(rootfs, &dest_abs);
        std::fs::create_dir_all(&target_dir)?;
        let bytes = std::fs::read(&canonical_source)?;
        apply_layer_tar(&bytes, &target_dir)?;
        collect_rel_paths(rootfs, &target_dir, copied);
        return Ok(());
    }

    if canonical_source.is_dir() {
        let target_dir = join_container_path(rootfs, &dest_abs);
        copy_dir_recursive(&canonical_source, &target_dir)?;
        collect_rel_paths(rootfs, &target_dir, copied);
    } else {
        let target = if dest_is_dir {
            let dir = join_container_path(rootfs, &dest_abs);
            std::fs::create_dir_all(&dir)?;
            dir.join(
                canonical_source
                    .file_name()
                    .unwrap_or(std::ffi::OsStr::new("")),
            )
        } else {
            let target = join_container_path(rootfs, &dest_abs);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            target
        };
        std::fs::copy(&canonical_source, &target)?;
        if let Ok(rel) = target.strip_prefix(rootfs) {
            copied.push(rel.to_path_buf());
        }
    }
    Ok(())
}

fn is_archive(path: &Path) -> bool {
    let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    name.ends_with(".tar") || name.ends_with(".tar.gz") || name.ends_with(".tgz")
}

fn copy_dir_recursive(src: &Path, dest: &Path) -> ServinResult<()> {
    std::fs::create_dir_all(dest)?;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| ServinError::Storage(format!("walk {}: {e}", src.display())))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| ServinError::Internal(e.to_string()))?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn collect_rel_paths(rootfs: &Path, dir: &Path, out: &mut Vec<PathBuf>) {
    for entry in WalkDir::new(dir).into_iter().flatten() {
        if let Ok(rel) = entry.path().strip_prefix(rootfs) {
            if !rel.as_os_str().is_empty() {
                out.push(rel.to_path_buf());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::layout::FilesystemLayout;
    use tempfile::tempdir;

    #[test]
    fn test_parse_basic_file() {
        let text = "# comment\nFROM alpine:latest\nENV APP_VERSION=1.0\nCMD [\"/bin/echo\",\"hi\"]\n";
        let parsed = parse_buildfile(text).unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0], BuildInstruction::From("alpine:latest".into()));
        assert_eq!(
            parsed[1],
            BuildInstruction::Env(vec![("APP_VERSION".into(), "1.0".into())])
        );
        assert_eq!(
            parsed[2],
            BuildInstruction::Cmd(vec!["/bin/echo".into(), "hi".into()])
        );
    }

    #[test]
    fn test_parse_continuations() {
        let text = "FROM alpine\nRUN echo a && \\\n    echo b\n";
        let parsed = parse_buildfile(text).unwrap();
        let BuildInstruction::Run(cmd) = &parsed[1] else {
            panic!("expected RUN, got {:?}", parsed[1]);
        };
        let normalized: Vec<&str> = cmd.split_whitespace().collect();
        assert_eq!(normalized, vec!["echo", "a", "&&", "echo", "b"]);
    }

    #[test]
    fn test_env_both_forms() {
        assert_eq!(
            parse_instruction("ENV KEY=value").unwrap(),
            BuildInstruction::Env(vec![("KEY".into(), "value".into())])
        );
        assert_eq!(
            parse_instruction("ENV KEY some value here").unwrap(),
            BuildInstruction::Env(vec![("KEY".into(), "some value here".into())])
        );
        assert_eq!(
            parse_instruction("ENV A=1 B=2").unwrap(),
            BuildInstruction::Env(vec![("A".into(), "1".into()), ("B".into(), "2".into())])
        );
    }

    #[test]
    fn test_cmd_shell_form_wraps_in_sh() {
        assert_eq!(
            parse_instruction("CMD echo hi").unwrap(),
            BuildInstruction::Cmd(vec!["/bin/sh".into(), "-c".into(), "echo hi".into()])
        );
    }

    #[test]
    fn test_unknown_instruction_rejected() {
        assert!(parse_instruction("TELEPORT now").is_err());
    }

    #[test]
    fn test_substitute_args() {
        let mut args = BTreeMap::new();
        args.insert("VERSION".to_string(), "1.0".to_string());
        assert_eq!(substitute_args("app-${VERSION}", &args), "app-1.0");
        assert_eq!(substitute_args("app-$VERSION", &args), "app-1.0");
        assert_eq!(substitute_args("app-$OTHER", &args), "app-$OTHER");
    }

    fn store_with_base() -> (tempfile::TempDir, ImageStore) {
        let dir = tempdir().unwrap();
        let layout = FilesystemLayout::new(dir.path().to_path_buf());
        layout.prepare().unwrap();
        let store = ImageStore::open(&layout).unwrap();

        // Minimal base image: one layer containing /etc/issue.
        let staging = tempdir().unwrap();
        std::fs::create_dir_all(staging.path().join("etc")).unwrap();
        std::fs::write(staging.path().join("etc/issue"), b"base").unwrap();
        let layer = pack_layer(
            staging.path(),
            vec![PathBuf::from("etc"), PathBuf::from("etc/issue")],
        )
        .unwrap();
        let layer_digest = store.put_blob(&layer).unwrap();
        let config = serde_json::to_vec(&ImageConfigBlob::new(RuntimeDefaults::default())).unwrap();
        let config_digest = store.put_blob(&config).unwrap();
        let manifest = ImageManifest::new(config_digest, vec![layer_digest]);
        store
            .register_image(&manifest, layer.len() as u64, &["alpine:latest".into()])
            .unwrap();

        (dir, store)
    }

    #[test]
    fn test_metadata_only_build_is_deterministic() {
        let (_dir, store) = store_with_base();

        let context = tempdir().unwrap();
        std::fs::write(
            context.path().join("Buildfile"),
            "FROM alpine:latest\nENV APP_VERSION=1.0\nCMD [\"/bin/echo\",\"hi\"]\n",
        )
        .unwrap();

        let mut options = BuildOptions {
            tag: Some("built:one".into()),
            ..Default::default()
        };
        options
            .build_args
            .insert("VERSION".to_string(), "1.0".to_string());

        let first = store.build(context.path(), &options).unwrap();
        options.tag = Some("built:two".into());
        let second = store.build(context.path(), &options).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.config.cmd, vec!["/bin/echo", "hi"]);
        assert_eq!(first.config.env_get("APP_VERSION"), Some("1.0"));
    }

    #[test]
    fn test_copy_produces_layer() {
        let (_dir, store) = store_with_base();

        let context = tempdir().unwrap();
        std::fs::write(context.path().join("app.txt"), b"payload").unwrap();
        std::fs::write(
            context.path().join("Buildfile"),
            "FROM alpine:latest\nCOPY app.txt /srv/app.txt\n",
        )
        .unwrap();

        let options = BuildOptions {
            tag: Some("copied:latest".into()),
            ..Default::default()
        };
        let record = store.build(context.path(), &options).unwrap();
        // Base layer plus the COPY layer.
        assert_eq!(record.layers.len(), 2);
    }

    #[test]
    fn test_copy_escaping_context_rejected() {
        let (_dir, store) = store_with_base();

        let context = tempdir().unwrap();
        std::fs::write(
            context.path().join("Buildfile"),
            "FROM alpine:latest\nCOPY ../secret /srv/\n",
        )
        .unwrap();

        let options = BuildOptions::default();
        assert!(store.build(context.path(), &options).is_err());
    }

    #[test]
    fn test_build_requires_from() {
        let (_dir, store) = store_with_base();
        let context = tempdir().unwrap();
        std::fs::write(context.path().join("Buildfile"), "RUN echo hi\n").unwrap();
        assert!(matches!(
            store.build(context.path(), &BuildOptions::default()),
            Err(ServinError::InvalidConfig(_))
        ));
    }
}
