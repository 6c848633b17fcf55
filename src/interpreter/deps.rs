// src/interpreter/deps.rs
//! Dependency inspection for submitted source code.
//!
//! The worker driver parses the source and reports the raw set of top-level
//! import targets (parsing lives where the parser lives); this module filters
//! that set down to the names that actually need installing: standard-library
//! modules are dropped, modules already present in the target environment are
//! dropped, and the survivors are translated through the best-effort
//! import-name to package-name map.
//!
//! Translation can be wrong when an import name differs from its installable
//! package in ways the map does not cover; the installer's failure is then
//! reported verbatim and execution proceeds, so the failing import surfaces
//! through the normal execution path.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing::{debug, warn};

use crate::protocol::Environment;

/// Import names whose installable package is spelled differently.
pub const MODULE_TO_PACKAGE: &[(&str, &str)] = &[
    ("bs4", "beautifulsoup4"),
    ("cv2", "opencv-python"),
    ("dotenv", "python-dotenv"),
    ("PIL", "pillow"),
    ("psycopg2", "psycopg2-binary"),
    ("sklearn", "scikit-learn"),
    ("tk", "tkinter"),
    ("wx", "wxPython"),
    ("yaml", "pyyaml"),
    ("zmq", "pyzmq"),
];

/// Top-level standard-library module names, never installable.
const STDLIB_MODULES: &[&str] = &[
    "__future__",
    "_thread",
    "abc",
    "aifc",
    "argparse",
    "array",
    "ast",
    "asyncio",
    "atexit",
    "audioop",
    "base64",
    "bdb",
    "binascii",
    "bisect",
    "builtins",
    "bz2",
    "cProfile",
    "calendar",
    "cgi",
    "cgitb",
    "chunk",
    "cmath",
    "cmd",
    "code",
    "codecs",
    "codeop",
    "collections",
    "colorsys",
    "compileall",
    "concurrent",
    "configparser",
    "contextlib",
    "contextvars",
    "copy",
    "copyreg",
    "crypt",
    "csv",
    "ctypes",
    "curses",
    "dataclasses",
    "datetime",
    "dbm",
    "decimal",
    "difflib",
    "dis",
    "doctest",
    "email",
    "encodings",
    "ensurepip",
    "enum",
    "errno",
    "faulthandler",
    "fcntl",
    "filecmp",
    "fileinput",
    "fnmatch",
    "fractions",
    "ftplib",
    "functools",
    "gc",
    "getopt",
    "getpass",
    "gettext",
    "glob",
    "graphlib",
    "grp",
    "gzip",
    "hashlib",
    "heapq",
    "hmac",
    "html",
    "http",
    "imaplib",
    "imghdr",
    "imp",
    "importlib",
    "inspect",
    "io",
    "ipaddress",
    "itertools",
    "json",
    "keyword",
    "linecache",
    "locale",
    "logging",
    "lzma",
    "mailbox",
    "mailcap",
    "marshal",
    "math",
    "mimetypes",
    "mmap",
    "modulefinder",
    "msvcrt",
    "multiprocessing",
    "netrc",
    "nntplib",
    "ntpath",
    "numbers",
    "opcode",
    "operator",
    "optparse",
    "os",
    "pathlib",
    "pdb",
    "pickle",
    "pickletools",
    "pipes",
    "pkgutil",
    "platform",
    "plistlib",
    "poplib",
    "posix",
    "posixpath",
    "pprint",
    "profile",
    "pstats",
    "pty",
    "pwd",
    "py_compile",
    "pyclbr",
    "pydoc",
    "queue",
    "quopri",
    "random",
    "re",
    "readline",
    "reprlib",
    "resource",
    "rlcompleter",
    "runpy",
    "sched",
    "secrets",
    "select",
    "selectors",
    "shelve",
    "shlex",
    "shutil",
    "signal",
    "site",
    "smtplib",
    "sndhdr",
    "socket",
    "socketserver",
    "sqlite3",
    "ssl",
    "stat",
    "statistics",
    "string",
    "stringprep",
    "struct",
    "subprocess",
    "sunau",
    "symtable",
    "sys",
    "sysconfig",
    "syslog",
    "tabnanny",
    "tarfile",
    "telnetlib",
    "tempfile",
    "termios",
    "test",
    "textwrap",
    "threading",
    "time",
    "timeit",
    "tkinter",
    "token",
    "tokenize",
    "tomllib",
    "trace",
    "traceback",
    "tracemalloc",
    "tty",
    "turtle",
    "types",
    "typing",
    "unicodedata",
    "unittest",
    "urllib",
    "uu",
    "uuid",
    "venv",
    "warnings",
    "wave",
    "weakref",
    "webbrowser",
    "winreg",
    "winsound",
    "wsgiref",
    "xdrlib",
    "xml",
    "xmlrpc",
    "zipapp",
    "zipfile",
    "zipimport",
    "zlib",
    "zoneinfo",
];

fn stdlib_modules() -> &'static HashSet<&'static str> {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| STDLIB_MODULES.iter().copied().collect())
}

/// Translate an import name to its installable package name.
pub fn package_for_module(module: &str) -> &str {
    MODULE_TO_PACKAGE
        .iter()
        .find(|(name, _)| *name == module)
        .map(|(_, package)| *package)
        .unwrap_or(module)
}

/// Filters import names against the standard library and an environment's
/// installed modules.
pub struct DependencyInspector {
    installed: HashSet<String>,
}

impl DependencyInspector {
    /// Build an inspector for the given environment.
    ///
    /// A venv's `site-packages` is scanned directly; for the system
    /// environment the interpreter is asked where its site directories live.
    pub async fn for_environment(env: &Environment) -> Self {
        let dirs = match env.site_packages() {
            Some(dir) => vec![dir],
            None => probe_system_site_dirs(env).await,
        };
        Self::from_site_dirs(&dirs)
    }

    /// Build an inspector from explicit site-packages directories.
    pub fn from_site_dirs(dirs: &[PathBuf]) -> Self {
        let mut installed = HashSet::new();
        for dir in dirs {
            scan_site_packages(dir, &mut installed);
        }
        debug!(modules = installed.len(), "indexed installed modules");
        Self { installed }
    }

    /// Whether a module is already resolvable without installing anything.
    pub fn is_resolvable(&self, module: &str) -> bool {
        stdlib_modules().contains(module) || self.installed.contains(module)
    }

    /// Reduce raw import names to the modules that are not yet resolvable.
    ///
    /// Returns sorted, deduplicated top-level module names; translate them
    /// with [`package_for_module`] before handing them to the installer.
    pub fn missing_modules(&self, names: &[String]) -> Vec<String> {
        let mut modules: Vec<String> = names
            .iter()
            .map(|name| name.split('.').next().unwrap_or(name))
            .filter(|name| !name.is_empty() && !name.starts_with('_'))
            .filter(|name| !self.is_resolvable(name))
            .map(str::to_string)
            .collect();
        modules.sort();
        modules.dedup();
        modules
    }

    /// The installable package names for a set of missing modules.
    pub fn packages_for(modules: &[String]) -> Vec<String> {
        let mut packages: Vec<String> = modules
            .iter()
            .map(|m| package_for_module(m).to_string())
            .collect();
        packages.sort();
        packages.dedup();
        packages
    }

    /// Record modules as present after a successful install, so repeated
    /// requests do not trigger the installer again.
    pub fn note_installed(&mut self, modules: &[String]) {
        for module in modules {
            let top = module.split('.').next().unwrap_or(module);
            self.installed.insert(top.to_string());
        }
    }
}

/// Collect top-level module names present in a site-packages directory.
fn scan_site_packages(dir: &Path, out: &mut HashSet<String>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => continue,
        };

        if name.ends_with(".dist-info") || name.ends_with(".egg-info") {
            // Prefer the distribution's own record of its top-level modules.
            match std::fs::read_to_string(path.join("top_level.txt")) {
                Ok(top_level) => {
                    for line in top_level.lines() {
                        let line = line.trim();
                        if !line.is_empty() {
                            out.insert(line.to_string());
                        }
                    }
                }
                Err(_) => {
                    // Fall back to the distribution name itself.
                    let stem = name
                        .trim_end_matches(".dist-info")
                        .trim_end_matches(".egg-info");
                    if let Some(dist) = stem.split('-').next() {
                        if !dist.is_empty() {
                            out.insert(dist.replace('-', "_"));
                        }
                    }
                }
            }
        } else if path.is_dir() {
            if path.join("__init__.py").is_file() {
                out.insert(name.to_string());
            }
        } else if let Some(stem) = name.strip_suffix(".py") {
            if !stem.is_empty() {
                out.insert(stem.to_string());
            }
        }
    }
}

/// Ask the system interpreter for its site directories.
async fn probe_system_site_dirs(env: &Environment) -> Vec<PathBuf> {
    let interpreter = match env.interpreter() {
        Ok(path) => path,
        Err(e) => {
            warn!("cannot probe site directories: {}", e);
            return Vec::new();
        }
    };

    let output = tokio::process::Command::new(&interpreter)
        .arg("-c")
        .arg(
            "import site, json; \
             print(json.dumps(list(site.getsitepackages()) + [site.getusersitepackages()]))",
        )
        .output()
        .await;

    match output {
        Ok(output) if output.status.success() => {
            serde_json::from_slice::<Vec<String>>(&output.stdout)
                .map(|dirs| dirs.into_iter().map(PathBuf::from).collect())
                .unwrap_or_default()
        }
        Ok(output) => {
            warn!(status = ?output.status, "site directory probe failed");
            Vec::new()
        }
        Err(e) => {
            warn!("site directory probe failed: {}", e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_stdlib_modules_are_never_missing() {
        let inspector = DependencyInspector::from_site_dirs(&[]);
        assert!(inspector
            .missing_modules(&names(&["os", "sys", "json", "asyncio"]))
            .is_empty());
    }

    #[test]
    fn test_unknown_modules_are_missing() {
        let inspector = DependencyInspector::from_site_dirs(&[]);
        assert_eq!(
            inspector.missing_modules(&names(&["requests"])),
            vec!["requests"]
        );
    }

    #[test]
    fn test_dotted_names_are_stripped() {
        let inspector = DependencyInspector::from_site_dirs(&[]);
        assert_eq!(
            inspector.missing_modules(&names(&["requests.sessions"])),
            vec!["requests"]
        );
    }

    #[test]
    fn test_package_translation() {
        let missing = names(&["PIL", "bs4", "cv2"]);
        assert_eq!(
            DependencyInspector::packages_for(&missing),
            vec!["beautifulsoup4", "opencv-python", "pillow"]
        );
    }

    #[test]
    fn test_private_names_are_ignored() {
        let inspector = DependencyInspector::from_site_dirs(&[]);
        assert!(inspector
            .missing_modules(&names(&["_internal", ""]))
            .is_empty());
    }

    #[test]
    fn test_site_packages_scan() {
        let dir = tempfile::tempdir().unwrap();
        let site = dir.path();

        // A package directory.
        std::fs::create_dir_all(site.join("requests")).unwrap();
        std::fs::write(site.join("requests/__init__.py"), "").unwrap();

        // A single-module distribution.
        std::fs::write(site.join("six.py"), "").unwrap();

        // A dist-info advertising a differently named module.
        std::fs::create_dir_all(site.join("pillow-10.0.0.dist-info")).unwrap();
        std::fs::write(site.join("pillow-10.0.0.dist-info/top_level.txt"), "PIL\n").unwrap();

        let inspector = DependencyInspector::from_site_dirs(&[site.to_path_buf()]);
        assert!(inspector.is_resolvable("requests"));
        assert!(inspector.is_resolvable("six"));
        assert!(inspector.is_resolvable("PIL"));
        assert!(!inspector.is_resolvable("numpy"));
    }

    #[test]
    fn test_note_installed_suppresses_reinstall() {
        let mut inspector = DependencyInspector::from_site_dirs(&[]);
        assert!(!inspector.missing_modules(&names(&["numpy"])).is_empty());
        inspector.note_installed(&names(&["numpy"]));
        assert!(inspector.missing_modules(&names(&["numpy"])).is_empty());
    }
}
