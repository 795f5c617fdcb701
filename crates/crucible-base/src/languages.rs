//! The static language registry: one record per supported language with the
//! toolchain invocations, limits, and sandbox template the worker needs.
//! The table is compiled in; nothing here is mutable at runtime.

use serde::Serialize;
use std::collections::BTreeMap;

/// A program plus its argument vector. Always spawned directly; never run
/// through a shell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandTemplate {
    pub program: &'static str,
    pub args: &'static [&'static str],
}

impl CommandTemplate {
    pub fn to_vec(&self) -> Vec<String> {
        std::iter::once(self.program.to_owned())
            .chain(self.args.iter().map(|a| (*a).to_owned()))
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Language {
    pub id: &'static str,
    pub display_name: &'static str,
    pub extension: &'static str,
    /// The name the source is written under in the workspace. Some toolchains
    /// mandate one (javac wants `Main.java` for `public class Main`).
    pub source_file: &'static str,
    pub compile: Option<CommandTemplate>,
    /// For interpreted languages this ends with the source filename; for
    /// compiled languages it invokes the artifact the compile step produced.
    pub run: CommandTemplate,
    pub timeout_ms: u64,
    pub memory_limit_bytes: u64,
    pub max_processes: u32,
    /// File name of the sandbox config template under the config directory.
    pub sandbox_template: &'static str,
    pub env: &'static [(&'static str, &'static str)],
}

impl Language {
    pub fn is_compiled(&self) -> bool {
        self.compile.is_some()
    }
}

const MIB: u64 = 1024 * 1024;

static LANGUAGES: &[Language] = &[
    Language {
        id: "python",
        display_name: "Python 3",
        extension: "py",
        source_file: "main.py",
        compile: None,
        run: CommandTemplate {
            program: "/usr/bin/python3",
            args: &["main.py"],
        },
        timeout_ms: 5_000,
        memory_limit_bytes: 256 * MIB,
        max_processes: 16,
        sandbox_template: "python.cfg",
        env: &[("PYTHONDONTWRITEBYTECODE", "1"), ("PYTHONUNBUFFERED", "1")],
    },
    Language {
        id: "javascript",
        display_name: "JavaScript (Node.js)",
        extension: "js",
        source_file: "main.js",
        compile: None,
        run: CommandTemplate {
            program: "/usr/bin/node",
            args: &["main.js"],
        },
        timeout_ms: 5_000,
        memory_limit_bytes: 512 * MIB,
        max_processes: 32,
        sandbox_template: "javascript.cfg",
        env: &[],
    },
    Language {
        id: "c",
        display_name: "C (GCC)",
        extension: "c",
        source_file: "main.c",
        compile: Some(CommandTemplate {
            program: "/usr/bin/gcc",
            args: &["-O2", "-std=c11", "-Wall", "main.c", "-o", "main"],
        }),
        run: CommandTemplate {
            program: "./main",
            args: &[],
        },
        timeout_ms: 5_000,
        memory_limit_bytes: 256 * MIB,
        max_processes: 8,
        sandbox_template: "c.cfg",
        env: &[],
    },
    Language {
        id: "cpp",
        display_name: "C++ (GCC)",
        extension: "cpp",
        source_file: "main.cpp",
        compile: Some(CommandTemplate {
            program: "/usr/bin/g++",
            args: &["-O2", "-std=c++17", "-Wall", "main.cpp", "-o", "main"],
        }),
        run: CommandTemplate {
            program: "./main",
            args: &[],
        },
        timeout_ms: 5_000,
        memory_limit_bytes: 256 * MIB,
        max_processes: 8,
        sandbox_template: "cpp.cfg",
        env: &[],
    },
    Language {
        id: "java",
        display_name: "Java (OpenJDK)",
        extension: "java",
        source_file: "Main.java",
        compile: Some(CommandTemplate {
            program: "/usr/bin/javac",
            args: &["Main.java"],
        }),
        run: CommandTemplate {
            program: "/usr/bin/java",
            args: &["-Xmx256m", "Main"],
        },
        timeout_ms: 10_000,
        memory_limit_bytes: 768 * MIB,
        max_processes: 64,
        sandbox_template: "java.cfg",
        env: &[],
    },
];

pub fn has(id: &str) -> bool {
    get(id).is_some()
}

pub fn get(id: &str) -> Option<&'static Language> {
    LANGUAGES.iter().find(|lang| lang.id == id)
}

pub fn all() -> &'static [Language] {
    LANGUAGES
}

/// What `GET /languages` exposes. Toolchain paths, sandbox template names,
/// and process caps stay internal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PublicLanguage {
    pub name: &'static str,
    pub extension: &'static str,
    pub compiled: bool,
    pub timeout_ms: u64,
    pub memory_limit_bytes: u64,
}

pub fn public_view() -> BTreeMap<&'static str, PublicLanguage> {
    LANGUAGES
        .iter()
        .map(|lang| {
            (
                lang.id,
                PublicLanguage {
                    name: lang.display_name,
                    extension: lang.extension,
                    compiled: lang.is_compiled(),
                    timeout_ms: lang.timeout_ms,
                    memory_limit_bytes: lang.memory_limit_bytes,
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lookup() {
        assert!(has("python"));
        assert!(has("java"));
        assert!(!has("fortran"));
        assert!(!has(""));
        assert_eq!(get("python").unwrap().source_file, "main.py");
        assert!(get("brainfuck").is_none());
    }

    #[test]
    fn interpreted_languages_run_their_source_file() {
        for lang in all().iter().filter(|lang| !lang.is_compiled()) {
            assert_eq!(
                lang.run.args.last().copied(),
                Some(lang.source_file),
                "{}",
                lang.id
            );
        }
    }

    #[test]
    fn compiled_languages_have_a_compile_step() {
        for id in ["c", "cpp", "java"] {
            assert!(get(id).unwrap().is_compiled(), "{id}");
        }
        for id in ["python", "javascript"] {
            assert!(!get(id).unwrap().is_compiled(), "{id}");
        }
    }

    #[test]
    fn fixed_source_names_are_honored() {
        // javac requires the file to be named after the public class.
        assert_eq!(get("java").unwrap().source_file, "Main.java");
    }

    #[test]
    fn every_language_has_a_sandbox_template_and_positive_limits() {
        for lang in all() {
            assert!(lang.sandbox_template.ends_with(".cfg"), "{}", lang.id);
            assert!(lang.timeout_ms > 0, "{}", lang.id);
            assert!(lang.memory_limit_bytes > 0, "{}", lang.id);
            assert!(lang.max_processes > 0, "{}", lang.id);
        }
    }

    #[test]
    fn language_ids_are_unique_and_colon_free() {
        let mut seen = std::collections::HashSet::new();
        for lang in all() {
            assert!(seen.insert(lang.id), "duplicate id {}", lang.id);
            // The content fingerprint uses ':' as its separator.
            assert!(!lang.id.contains(':'), "{}", lang.id);
        }
    }

    #[test]
    fn public_view_strips_toolchain_paths() {
        let encoded = serde_json::to_string(&public_view()).unwrap();
        assert!(!encoded.contains("/usr/bin"));
        assert!(!encoded.contains(".cfg"));
    }

    #[test]
    fn public_view_is_pure() {
        assert_eq!(public_view(), public_view());
    }

    #[test]
    fn command_template_to_vec_leads_with_the_program() {
        let run = get("python").unwrap().run;
        assert_eq!(run.to_vec(), vec!["/usr/bin/python3", "main.py"]);
    }
}
