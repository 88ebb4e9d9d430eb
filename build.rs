use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Only the crate's own sources are policed. Anything else under the package root
// (vendored data, reference material) is not ours to lint.
const SOURCE_DIRS: [&str; 5] = ["score", "cluster", "src", "tests", "benches"];

const FORBIDDEN_WORDS: [&str; 14] = [
    "FIXED",
    "CORRECTED",
    "FIX",
    "FIXES",
    "NEW",
    "CHANGED",
    "CHANGES",
    "CHANGE",
    "MODIFIED",
    "MODIFIES",
    "MODIFY",
    "UPDATED",
    "UPDATES",
    "UPDATE",
];

/// The kind of policy a collector enforces, used to word its error message.
#[derive(Clone, Copy)]
enum Policy {
    UnderscorePrefix,
    ForbiddenComment,
    UppercaseComment,
    AllowDeadCode,
}

impl Policy {
    fn headline(self) -> &'static str {
        match self {
            Self::UnderscorePrefix => "underscore-prefixed variables",
            Self::ForbiddenComment => "forbidden comment patterns",
            Self::UppercaseComment => "comments with all uppercase alphabetic characters",
            Self::AllowDeadCode => "#[allow(dead_code)] attributes",
        }
    }

    fn advice(self) -> &'static str {
        match self {
            Self::UnderscorePrefix => {
                "Underscore-prefixed variable names are not allowed in this project.\n   Either use the variable (removing the underscore) or remove it completely."
            }
            Self::ForbiddenComment => {
                "Change-log style words in comments are not allowed, and '**' is only allowed in doc comments.\n   Remove these patterns before committing."
            }
            Self::UppercaseComment => {
                "Comments where all alphabetic characters are uppercase are not allowed.\n   Strongly consider deleting the comment completely."
            }
            Self::AllowDeadCode => {
                "#[allow(dead_code)] attributes are not allowed in this project.\n   Either use the code or remove it completely."
            }
        }
    }
}

// Collects every offending line of one file so the error names all of them at once.
struct Collector {
    policy: Policy,
    violations: Vec<String>,
    file_path: PathBuf,
}

impl Collector {
    fn new(policy: Policy, file_path: &Path) -> Self {
        Self {
            policy,
            violations: Vec::new(),
            file_path: file_path.to_path_buf(),
        }
    }

    fn check_and_get_error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }
        let file_name = self.file_path.to_str().unwrap_or("?");
        let mut error_msg = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            self.policy.headline(),
            file_name
        );
        for violation in &self.violations {
            error_msg.push_str(&format!("   {violation}\n"));
        }
        error_msg.push_str(&format!("\n⚠️ {}\n", self.policy.advice()));
        Some(error_msg)
    }

    fn accepts(&self, line_text: &str) -> bool {
        match self.policy {
            Policy::UnderscorePrefix => !is_comment(line_text) && !underscore_in_string(line_text),
            Policy::ForbiddenComment => {
                let has_forbidden_word = FORBIDDEN_WORDS.iter().any(|word| line_text.contains(word));
                has_forbidden_word || !is_doc_comment(line_text)
            }
            Policy::UppercaseComment => comment_text(line_text).is_some_and(|text| {
                let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
                letters.peek().is_some() && letters.all(char::is_uppercase)
            }),
            Policy::AllowDeadCode => true,
        }
    }
}

impl Sink for Collector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.accepts(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn is_doc_comment(line: &str) -> bool {
    line.trim_start().starts_with("///")
}

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with("//") || line.contains("/*")
}

// Odd-numbered pieces of a quote split are inside string literals.
fn underscore_in_string(line: &str) -> bool {
    line.split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'))
}

fn comment_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("///") {
        return Some(rest.trim());
    }
    if let Some(rest) = trimmed.strip_prefix("//") {
        return Some(rest.trim());
    }
    let start = line.find("/*")? + 2;
    let rest = &line[start..];
    Some(rest.find("*/").map_or(rest, |end| &rest[..end]).trim())
}

fn source_files() -> Vec<PathBuf> {
    SOURCE_DIRS
        .iter()
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect()
}

fn scan(policy: Policy, pattern: &str, files: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(pattern)?;
    let mut searcher = Searcher::new();
    for path in files {
        let mut collector = Collector::new(policy, path);
        searcher.search_path(&matcher, path, &mut collector)?;
        if let Some(error_message) = collector.check_and_get_error_message() {
            return Err(error_message.into());
        }
    }
    Ok(())
}

fn run_policies() -> Result<(), Box<dyn Error>> {
    let files = source_files();
    scan(Policy::UnderscorePrefix, r"\b(_[a-zA-Z0-9_]+)\b", &files)?;
    let forbidden_words = format!(r"(//|/\*|///).*(?:{})", FORBIDDEN_WORDS.join("|"));
    scan(Policy::ForbiddenComment, &forbidden_words, &files)?;
    scan(Policy::ForbiddenComment, r"(//|/\*).*\*\*", &files)?;
    scan(Policy::UppercaseComment, r"(//|/\*|///).*", &files)?;
    scan(
        Policy::AllowDeadCode,
        r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        &files,
    )?;
    Ok(())
}

// Compiles this script on its own with the lints the crate denies, so the build
// script is held to the same standard as the code it polices.
fn check_build_script() {
    let out_dir = std::env::var("OUT_DIR").unwrap_or_else(|_| ".".to_string());
    let output = std::process::Command::new("rustc")
        .args([
            "--edition",
            "2021",
            "-D",
            "unused_variables",
            "-D",
            "dead_code",
            "-D",
            "unused_imports",
            "--crate-type",
            "bin",
            "--emit",
            "metadata",
            "--out-dir",
            &out_dir,
            "--error-format",
            "human",
            "build.rs",
        ])
        .output();

    match output {
        Ok(output) if !output.status.success() => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lint_failed = ["unused variable", "is never used", "unused import"]
                .iter()
                .any(|needle| stderr.contains(needle));
            if lint_failed {
                eprintln!("\n❌ ERROR: build.rs does not follow the crate's lint policy!");
                eprintln!("{stderr}");
                std::process::exit(1);
            }
        }
        Ok(_) => {}
        Err(_) => {
            println!("cargo:warning=Could not lint build.rs with rustc");
        }
    }
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    check_build_script();

    if let Err(e) = run_policies() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
