//! Entrypoint extraction from Dockerfile source.

/// Command run when a Dockerfile declares neither `ENTRYPOINT` nor `CMD`.
pub const DEFAULT_ENTRYPOINT: [&str; 2] = ["sleep", "infinity"];

/// Entrypoint for a workspace built from `dockerfile`.
///
/// The last `ENTRYPOINT` wins, else the last `CMD`. Exec form (a JSON array
/// of strings) is taken as-is; shell form becomes a single token with quotes
/// removed.
pub fn entrypoint_from_dockerfile(dockerfile: &str) -> Vec<String> {
    let instructions = logical_lines(dockerfile);

    last_argument(&instructions, "ENTRYPOINT")
        .or_else(|| last_argument(&instructions, "CMD"))
        .map(parse_command)
        .unwrap_or_else(|| DEFAULT_ENTRYPOINT.iter().map(|s| s.to_string()).collect())
}

/// Lines with `\` continuations folded and comments dropped.
fn logical_lines(dockerfile: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    for raw in dockerfile.lines() {
        let line = raw.trim();
        if current.is_empty() && (line.is_empty() || line.starts_with('#')) {
            continue;
        }
        match line.strip_suffix('\\') {
            Some(head) => {
                current.push_str(head.trim_end());
                current.push(' ');
            }
            None => {
                current.push_str(line);
                lines.push(std::mem::take(&mut current));
            }
        }
    }
    if !current.trim().is_empty() {
        lines.push(current);
    }
    lines
}

fn last_argument<'a>(instructions: &'a [String], keyword: &str) -> Option<&'a str> {
    instructions.iter().rev().find_map(|line| {
        let (head, rest) = line.split_once(char::is_whitespace)?;
        let rest = rest.trim();
        (head.eq_ignore_ascii_case(keyword) && !rest.is_empty()).then_some(rest)
    })
}

fn parse_command(argument: &str) -> Vec<String> {
    if let Ok(exec) = serde_json::from_str::<Vec<String>>(argument) {
        return exec;
    }
    vec![argument.replace(['"', '\''], "")]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("FROM alpine\nENTRYPOINT [\"/bin/app\", \"--serve\"]\n", &["/bin/app", "--serve"])]
    #[case("FROM alpine\nCMD [\"python\", \"main.py\"]", &["python", "main.py"])]
    #[case("FROM alpine\nENTRYPOINT \"/bin/app --serve\"", &["/bin/app --serve"])]
    #[case("FROM alpine\nCMD ['node', index.js", &["[node, index.js"])]
    #[case("FROM alpine\nRUN apk add curl", &["sleep", "infinity"])]
    #[case("", &["sleep", "infinity"])]
    fn test_entrypoint(#[case] dockerfile: &str, #[case] expected: &[&str]) {
        assert_eq!(entrypoint_from_dockerfile(dockerfile), expected);
    }

    #[test]
    fn test_entrypoint_wins_over_cmd() {
        let dockerfile = "FROM alpine\nENTRYPOINT [\"/init\"]\nCMD [\"--help\"]\n";
        assert_eq!(entrypoint_from_dockerfile(dockerfile), vec!["/init"]);
    }

    #[test]
    fn test_last_instruction_wins() {
        let dockerfile = "FROM a AS build\nCMD [\"make\"]\nFROM b\nCMD [\"/srv/run\"]\n";
        assert_eq!(entrypoint_from_dockerfile(dockerfile), vec!["/srv/run"]);
    }

    #[test]
    fn test_lowercase_keyword_and_continuation() {
        let dockerfile = "from alpine\n# ENTRYPOINT [\"ignored\"]\nentrypoint [\"/bin/sh\", \\\n  \"-c\", \"serve\"]\n";
        assert_eq!(entrypoint_from_dockerfile(dockerfile), vec!["/bin/sh", "-c", "serve"]);
    }
}
