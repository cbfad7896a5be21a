use std::path::{Path, PathBuf};

use walkdir::WalkDir;

fn has_wildcard(component: &str) -> bool {
    component.contains(['*', '?', '['])
}

/// Expand a shell-style pattern into the existing paths it matches, sorted.
///
/// Wildcards (`*`, `?`, `[...]`) apply within one path component. The walk starts at
/// the longest wildcard-free prefix and descends exactly as deep as the pattern.
pub fn expand_glob(pattern: &str) -> Vec<PathBuf> {
    let absolute = pattern.starts_with('/');
    let components: Vec<&str> = pattern.split('/').filter(|c| !c.is_empty()).collect();
    let literal = components.iter().take_while(|c| !has_wildcard(c)).count();

    let mut root = if absolute { PathBuf::from("/") } else { PathBuf::new() };
    for c in &components[..literal] {
        root.push(c);
    }

    let rest: Vec<Vec<char>> = components[literal..].iter().map(|c| c.chars().collect()).collect();
    if rest.is_empty() {
        return if root.exists() { vec![root] } else { Vec::new() };
    }

    let relative_root = root.as_os_str().is_empty();
    let walk_root = if relative_root { PathBuf::from(".") } else { root };
    let depth = rest.len();

    let mut matches: Vec<PathBuf> = WalkDir::new(&walk_root)
        .follow_links(true)
        .min_depth(depth)
        .max_depth(depth)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || e
                    .file_name()
                    .to_str()
                    .is_some_and(|name| match_component(&rest[e.depth() - 1], name))
        })
        .filter_map(|e| match e {
            Ok(e) => Some(e.into_path()),
            Err(err) => {
                tracing::debug!(error = %err, "skipping unreadable path during glob");
                None
            }
        })
        .map(|p| if relative_root { strip_dot(&p) } else { p })
        .collect();
    matches.sort();
    matches
}

fn strip_dot(p: &Path) -> PathBuf {
    p.strip_prefix(".").map(Path::to_path_buf).unwrap_or_else(|_| p.to_path_buf())
}

/// Match one file name against one pattern component. A leading `.` must be matched literally.
pub fn match_component(pattern: &[char], name: &str) -> bool {
    let name: Vec<char> = name.chars().collect();
    if name.first() == Some(&'.') && pattern.first() != Some(&'.') {
        return false;
    }

    let (mut p, mut n) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;
    while n < name.len() {
        let step = match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, n));
                p += 1;
                continue;
            }
            Some('?') => Some(p + 1),
            Some('[') => match match_class(pattern, p, name[n]) {
                Some((true, next)) => Some(next),
                Some((false, _)) => None,
                None => (name[n] == '[').then_some(p + 1),
            },
            Some(c) if *c == name[n] => Some(p + 1),
            _ => None,
        };
        match (step, backtrack) {
            (Some(next), _) => {
                p = next;
                n += 1;
            }
            (None, Some((star, at))) => {
                p = star + 1;
                n = at + 1;
                backtrack = Some((star, at + 1));
            }
            (None, None) => return false,
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

/// `[abc]`, `[a-z]`, `[!x]`. Returns (hit, index after `]`), or `None` when unterminated.
fn match_class(pattern: &[char], open: usize, c: char) -> Option<(bool, usize)> {
    let mut i = open + 1;
    let negate = matches!(pattern.get(i), Some('!') | Some('^'));
    if negate {
        i += 1;
    }
    let mut hit = false;
    let mut first = true;
    loop {
        let cur = *pattern.get(i)?;
        if cur == ']' && !first {
            return Some((hit != negate, i + 1));
        }
        first = false;
        match (pattern.get(i + 1), pattern.get(i + 2)) {
            (Some('-'), Some(&hi)) if hi != ']' => {
                hit |= cur <= c && c <= hi;
                i += 3;
            }
            _ => {
                hit |= cur == c;
                i += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(pattern: &str, name: &str) -> bool {
        match_component(&pattern.chars().collect::<Vec<_>>(), name)
    }

    #[test]
    fn component_wildcards() {
        assert!(m("aia.0171.20200101_00*.fits", "aia.0171.20200101_0001.fits"));
        assert!(!m("aia.0171.20200101_00*.fits", "aia.0171.20200101_0101.fits"));
        assert!(m("a?c", "abc"));
        assert!(!m("a?c", "ac"));
        assert!(m("*b*", "abc"));
        assert!(m("[a-c]x", "bx"));
        assert!(!m("[!a-c]x", "bx"));
        assert!(m("[[]x", "[x"));
        assert!(!m("*", ".hidden"));
        assert!(m(".*", ".hidden"));
    }

    #[test]
    fn expands_sorted_across_directories() {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["2020/01/02", "2020/01/01"] {
            std::fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        for f in ["2020/01/02/b_1.fits", "2020/01/01/b_2.fits", "2020/01/01/a_9.fits", "2020/01/01/b_1.txt"] {
            std::fs::write(dir.path().join(f), b"").unwrap();
        }
        let pattern = format!("{}/2020/*/*/?_[0-9].fits", dir.path().display());
        let got: Vec<_> = expand_glob(&pattern)
            .into_iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(got, vec!["2020/01/01/a_9.fits", "2020/01/01/b_2.fits", "2020/01/02/b_1.fits"]);
    }

    #[test]
    fn literal_pattern_and_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("x.fits");
        std::fs::write(&f, b"").unwrap();
        assert_eq!(expand_glob(&f.display().to_string()), vec![f]);
        assert!(expand_glob(&format!("{}/missing/*.fits", dir.path().display())).is_empty());
    }
}
