use std::env;
use std::fs;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};

pub mod commands;

/// Canonicalize the path if possible, falling back to the given string
/// relative to the current working directory.
pub fn canonicalize_or_current(root: &str) -> Result<PathBuf> {
    let path = Path::new(root);
    if path == Path::new(".") {
        Ok(env::current_dir().context("Failed to get current directory")?)
    } else {
        // Paths that do not exist yet are joined with the current dir.
        match path.canonicalize() {
            Ok(p) => Ok(p),
            Err(_) => {
                let cwd = env::current_dir().context("Failed to get current directory")?;
                Ok(cwd.join(path))
            }
        }
    }
}

/// Artifact name for an output path: the file name without its last
/// extension, or `a.out` when there is none.
pub fn infer_output_name(path: &Path) -> String {
    path.file_stem().and_then(|os_str| os_str.to_str()).unwrap_or("a.out").to_string()
}

/// Compute the SHA-256 hash of a file and return it as a hex string.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file =
        fs::File::open(path).with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = reader.read(&mut buf).with_context(|| format!("Failed to read file for hashing: {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    let digest = hasher.finalize();
    Ok(format!("{:x}", digest))
}

/// Parse a decimal or `0x`-prefixed hexadecimal number.
pub fn parse_u64(text: &str) -> Result<u64> {
    let trimmed = text.trim();
    let parsed = match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => trimmed.replace('_', "").parse::<u64>(),
    };
    parsed.map_err(|e| anyhow!("Invalid number '{text}': {e}"))
}

/// Split `key=value`.
pub fn parse_assignment(text: &str) -> Result<(&str, &str)> {
    text.split_once('=')
        .map(|(k, v)| (k.trim(), v.trim()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| anyhow!("Expected KEY=VALUE, got '{text}'"))
}

/// Parse `key=value` where both sides are numbers.
pub fn parse_number_pair(text: &str) -> Result<(u64, u64)> {
    let (key, value) = parse_assignment(text)?;
    Ok((parse_u64(key)?, parse_u64(value)?))
}
