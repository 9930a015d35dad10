//! Command lines typed by the user
//!
//! Only a handful of tools exist: the compiler driver, the linker, `run`,
//! and binaries already in the filesystem. The driver is emulated here
//! because the real one would spawn subprocesses; `-cc1` lines go to the
//! front-end untouched.

use super::Language;

/// Split a command line on whitespace, honoring single and double quotes
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

/// Replace every `<filename>` placeholder
pub fn substitute_filename(line: &str, file_name: &str) -> String {
    line.replace("<filename>", file_name)
}

/// Parsed `clang`/`clang++` driver invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverArgs {
    /// `-c`: stop after producing objects
    pub compile_only: bool,
    /// `-o <path>`
    pub output: Option<String>,
    /// `-O<level>`
    pub opt_level: Option<String>,
    /// Source files to compile
    pub sources: Vec<(String, Language)>,
    /// Objects passed straight to the linker
    pub objects: Vec<String>,
}

impl DriverArgs {
    /// `language` is the default for sources without a recognized extension
    pub fn parse(args: &[String], language: Language) -> Result<Self, String> {
        let mut parsed = DriverArgs::default();
        let mut iter = args.iter();

        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-c" => parsed.compile_only = true,
                "-o" => {
                    let out = iter.next().ok_or("missing path after -o")?;
                    parsed.output = Some(out.clone());
                }
                flag if flag.starts_with("-O") => {
                    parsed.opt_level = Some(flag[2..].to_string());
                }
                flag if flag.starts_with('-') => {
                    return Err(format!("unsupported driver flag {}", flag));
                }
                path if path.ends_with(".o") => parsed.objects.push(path.to_string()),
                path => {
                    let lang = Language::from_file_name(path).unwrap_or(language);
                    if lang == Language::Python {
                        return Err(format!("{} is not a C or C++ source", path));
                    }
                    parsed.sources.push((path.to_string(), lang));
                }
            }
        }

        if parsed.sources.is_empty() && parsed.objects.is_empty() {
            return Err("no input files".to_string());
        }
        if parsed.compile_only && parsed.output.is_some() && parsed.sources.len() > 1 {
            return Err("cannot specify -o with -c and multiple sources".to_string());
        }
        Ok(parsed)
    }
}

/// `main.cc` -> `main.o`
pub fn object_path(source: &str) -> String {
    match source.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => format!("{}.o", stem),
        _ => format!("{}.o", source),
    }
}

/// `main.cc` -> `main.wasm`
pub fn binary_path(source: &str) -> String {
    match source.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => format!("{}.wasm", stem),
        _ => format!("{}.wasm", source),
    }
}
