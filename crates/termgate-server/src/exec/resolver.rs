//! Command resolution.
//!
//! Built once at startup and read-only afterwards. A program name is
//! resolved through, in order: the alias table, the candidate directories
//! next to the working directory and the gateway binary, then `PATH`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

const SNMP_TOOLS: &[&str] = &[
    "snmpget",
    "snmpgetnext",
    "snmpdf",
    "snmpbulkget",
    "snmpbulkwalk",
    "snmpdelta",
    "snmpnetstat",
    "snmpset",
    "snmpstatus",
    "snmptable",
    "snmptest",
    "snmptools",
    "snmptranslate",
    "snmptrap",
    "snmpusm",
    "snmpvacm",
    "snmpwalk",
    "wshell",
];

const SUBDIRS: &[&str] = &["", "bin", "tools", "runtime_env"];

#[cfg(windows)]
const EXTENSIONS: &[&str] = &["", ".bat", ".com", ".exe"];
#[cfg(not(windows))]
const EXTENSIONS: &[&str] = &["", ".sh"];

#[derive(Debug, Default, Clone)]
pub struct CommandResolver {
    aliases: HashMap<String, PathBuf>,
    roots: Vec<PathBuf>,
}

impl CommandResolver {
    /// Resolver searching `roots` only, with no aliases.
    pub fn with_roots(roots: Vec<PathBuf>) -> Self {
        Self {
            aliases: HashMap::new(),
            roots,
        }
    }

    /// Search roots for a working directory and executable directory:
    /// each directory and its parent.
    pub fn roots_for(cwd: &Path, exe_dir: Option<&Path>) -> Vec<PathBuf> {
        let mut roots = vec![cwd.to_path_buf()];
        if let Some(parent) = cwd.parent() {
            roots.push(parent.to_path_buf());
        }
        if let Some(dir) = exe_dir {
            roots.push(dir.to_path_buf());
            if let Some(parent) = dir.parent() {
                roots.push(parent.to_path_buf());
            }
        }
        roots.dedup();
        roots
    }

    /// Build the resolver for this process and fill the alias table.
    ///
    /// `executable_dir` overrides the directory of the running binary.
    pub fn discover(executable_dir: Option<PathBuf>) -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let exe_dir = executable_dir.or_else(|| {
            std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(Path::to_path_buf))
        });
        let mut resolver = Self::with_roots(Self::roots_for(&cwd, exe_dir.as_deref()));
        resolver.fill_aliases();
        info!(
            aliases = resolver.aliases.len(),
            roots = resolver.roots.len(),
            "command resolver ready"
        );
        resolver
    }

    fn fill_aliases(&mut self) {
        for tool in SNMP_TOOLS {
            let candidates = [
                tool.to_string(),
                format!("netsnmp/{}", tool),
                format!("net-snmp/{}", tool),
            ];
            self.alias_first(&[tool], &candidates);
        }
        self.alias_first(&["tpt"], &["tpt".to_string()]);
        for tool in ["nping", "nmap"] {
            self.alias_first(&[tool], &[format!("nmap/{}", tool), tool.to_string()]);
        }
        self.alias_first(&["plink", "ssh"], &["putty/plink".to_string(), "ssh".to_string()]);
        self.alias_first(&["dig"], &["dig/dig".to_string(), "dig".to_string()]);
    }

    fn alias_first(&mut self, names: &[&str], candidates: &[String]) {
        if let Some(path) = self.look_path(candidates) {
            for name in names {
                debug!(alias = name, path = %path.display(), "command alias");
                self.aliases.insert(name.to_string(), path.clone());
            }
        }
    }

    /// Register an alias explicitly.
    pub fn register(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) {
        self.aliases.insert(name.into(), path.into());
    }

    pub fn alias(&self, name: &str) -> Option<&Path> {
        self.aliases.get(name).map(PathBuf::as_path)
    }

    /// First existing file among the candidates, trying every root and
    /// sub-directory before falling back to `PATH`.
    pub fn look_path(&self, names: &[String]) -> Option<PathBuf> {
        for name in names {
            for ext in EXTENSIONS {
                let file = format!("{}{}", name, ext);
                for root in &self.roots {
                    for sub in SUBDIRS {
                        let path = root.join(sub).join(&file);
                        if path.is_file() {
                            return Some(path);
                        }
                    }
                }
            }
        }
        names.iter().find_map(|name| which::which(name).ok())
    }

    /// Resolve a program name to what should be executed. Unknown names
    /// are returned as given and left to the OS.
    pub fn resolve(&self, program: &str) -> String {
        if let Some(path) = self.alias(program) {
            return path.display().to_string();
        }
        match self.look_path(&[program.to_string()]) {
            Some(path) => path.display().to_string(),
            None => program.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"#!/bin/sh\n").unwrap();
    }

    #[test]
    fn roots_include_parents() {
        let roots = CommandResolver::roots_for(Path::new("/opt/app/run"), Some(Path::new("/opt/bin")));
        assert_eq!(
            roots,
            vec![
                PathBuf::from("/opt/app/run"),
                PathBuf::from("/opt/app"),
                PathBuf::from("/opt/bin"),
                PathBuf::from("/opt"),
            ]
        );
    }

    #[test]
    fn finds_tools_under_candidate_subdirs() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("tools/netsnmp/snmpwalk"));
        touch(&dir.path().join("runtime_env/collect.sh"));

        let resolver = CommandResolver::with_roots(vec![dir.path().to_path_buf()]);
        assert_eq!(
            resolver.look_path(&["snmpwalk".into(), "netsnmp/snmpwalk".into()]),
            Some(dir.path().join("tools/netsnmp/snmpwalk"))
        );
        #[cfg(not(windows))]
        assert_eq!(
            resolver.resolve("collect"),
            dir.path().join("runtime_env/collect.sh").display().to_string()
        );
    }

    #[test]
    fn aliases_win_over_search() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("bin/ssh"));

        let mut resolver = CommandResolver::with_roots(vec![dir.path().to_path_buf()]);
        resolver.register("ssh", "/opt/putty/plink");
        assert_eq!(resolver.resolve("ssh"), "/opt/putty/plink");
    }

    #[test]
    fn plink_alias_covers_ssh() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("putty/plink"));

        let mut resolver = CommandResolver::with_roots(vec![dir.path().to_path_buf()]);
        resolver.fill_aliases();
        let plink = dir.path().join("putty/plink");
        assert_eq!(resolver.alias("plink"), Some(plink.as_path()));
        assert_eq!(resolver.alias("ssh"), Some(plink.as_path()));
    }

    #[test]
    fn unknown_program_is_left_alone() {
        let resolver = CommandResolver::with_roots(Vec::new());
        assert_eq!(
            resolver.resolve("definitely-not-a-real-tool-xyz"),
            "definitely-not-a-real-tool-xyz"
        );
    }

    #[test]
    #[cfg(unix)]
    fn falls_back_to_path() {
        let resolver = CommandResolver::with_roots(Vec::new());
        let sh = resolver.resolve("sh");
        assert!(sh.ends_with("/sh"), "resolved to {}", sh);
    }
}
