//! Log scanning: grep-style filters applied to tool log files, with
//! matches written to per-suffix report files.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use fab_core::Chip;
use log::info;
use regex::RegexBuilder;

/// Apply one grep-style filter to a line. The supported option letters
/// are `-v` (invert), `-i` (ignore case), `-E` (extended pattern, the
/// native dialect here), `-e` (next token starts the pattern), `-x`
/// (whole line), `-o` (emit only the match), and `-w` (whole words).
/// Returns the surviving text, or None when the line is filtered out.
pub fn grep_line(args: &str, line: &str) -> Option<String> {
    let mut invert = false;
    let mut ignore_case = false;
    let mut whole_line = false;
    let mut only_match = false;
    let mut whole_word = false;

    let tokens: Vec<&str> = args.split_whitespace().collect();
    let mut pattern_start = 0;
    for (i, token) in tokens.iter().enumerate() {
        match *token {
            "-v" => invert = true,
            "-i" => ignore_case = true,
            "-E" => {}
            "-x" => whole_line = true,
            "-o" => only_match = true,
            "-w" => whole_word = true,
            "-e" => {
                pattern_start = i + 1;
                break;
            }
            _ => {
                pattern_start = i;
                break;
            }
        }
        pattern_start = i + 1;
    }
    let mut pattern = tokens[pattern_start..].join(" ");
    if pattern.is_empty() {
        return None;
    }
    if whole_word {
        pattern = format!(r"\b(?:{})\b", pattern);
    }
    if whole_line {
        pattern = format!(r"^(?:{})$", pattern);
    }

    let regex = RegexBuilder::new(&pattern)
        .case_insensitive(ignore_case)
        .build()
        .ok()?;

    let found = regex.find(line);
    if found.is_some() == invert {
        return None;
    }
    match (only_match, found) {
        (true, Some(m)) => Some(m.as_str().to_string()),
        _ => Some(line.to_string()),
    }
}

/// Scan a task log against the tool's `regex` filter chains, writing the
/// matches for suffix `s` to `<step>.<s>` in the work directory and
/// echoing them through the logger unless quiet.
pub fn check_logfile(
    chip: &Chip,
    workdir: &Path,
    tool: &str,
    step: &str,
    index: &str,
    display: bool,
) -> std::io::Result<()> {
    if !chip.valid(&["eda", tool, "regex", step, index, "default"], true) {
        return Ok(());
    }
    let suffixes = chip.getkeys(&["eda", tool, "regex", step, index]);
    if suffixes.is_empty() {
        return Ok(());
    }

    let mut checks: Vec<(Vec<String>, File)> = Vec::new();
    for suffix in &suffixes {
        let filters = chip.get_strings(&["eda", tool, "regex", step, index, suffix]);
        let report = File::create(workdir.join(format!("{}.{}", step, suffix)))?;
        checks.push((filters, report));
    }

    let logfile = workdir.join(format!("{}.log", step));
    let reader = BufReader::new(File::open(&logfile)?);
    for line in reader.lines() {
        let line = line?;
        for (filters, report) in checks.iter_mut() {
            let mut current = Some(line.clone());
            for filter in filters.iter() {
                current = match current {
                    Some(text) => grep_line(filter, &text),
                    None => break,
                };
            }
            if let Some(text) = current {
                writeln!(report, "{}", text.trim())?;
                if display {
                    info!("{}", text.trim());
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_pattern() {
        assert!(grep_line("ERROR", "syntax ERROR at line 3").is_some());
        assert!(grep_line("ERROR", "all clean").is_none());
    }

    #[test]
    fn test_invert() {
        assert!(grep_line("-v ERROR", "all clean").is_some());
        assert!(grep_line("-v ERROR", "syntax ERROR").is_none());
    }

    #[test]
    fn test_ignore_case() {
        assert!(grep_line("-i error", "Fatal ERROR found").is_some());
    }

    #[test]
    fn test_only_match() {
        assert_eq!(
            grep_line("-o -E [0-9]+ warnings", "found 12 warnings today").as_deref(),
            Some("12 warnings")
        );
    }

    #[test]
    fn test_whole_word() {
        assert!(grep_line("-w err", "an err occurred").is_some());
        assert!(grep_line("-w err", "no errors here").is_none());
    }

    #[test]
    fn test_whole_line() {
        assert!(grep_line("-x DONE", "DONE").is_some());
        assert!(grep_line("-x DONE", "DONE DONE").is_none());
    }

    #[test]
    fn test_dash_e_pattern() {
        assert!(grep_line("-i -e -timing violated", "-Timing violated on path").is_some());
    }

    #[test]
    fn test_filter_chain_via_logfile() {
        use fab_core::Chip;

        let dir = tempfile::tempdir().unwrap();
        let mut chip = Chip::new(Some("top"));
        chip.add(&["eda", "yosys", "regex", "syn", "0", "errors"], vec!["-v clean", "error"]);
        std::fs::write(
            dir.path().join("syn.log"),
            "clean error ignored\nreal error here\nnothing\n",
        )
        .unwrap();

        check_logfile(&chip, dir.path(), "yosys", "syn", "0", false).unwrap();

        let report = std::fs::read_to_string(dir.path().join("syn.errors")).unwrap();
        assert_eq!(report.trim(), "real error here");
    }
}
