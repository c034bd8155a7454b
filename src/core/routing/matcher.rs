//! Topic pattern matching.
//!
//! Patterns and routing keys are split on `.` into segments. In a pattern
//! `*` stands for exactly one segment and `#` for zero or more segments;
//! every other segment must match literally. Segments may be empty, so
//! `""` is a single empty segment and `a..b` has three.

const SEPARATOR: char = '.';
const ONE: &str = "*";
const ANY: &str = "#";

/// Returns `true` if `routing_key` matches the topic `pattern`.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    if pattern == ANY {
        return true;
    }
    let pattern: Vec<&str> = pattern.split(SEPARATOR).collect();
    let key: Vec<&str> = routing_key.split(SEPARATOR).collect();
    match_segments(&pattern, &key)
}

/// Greedy walk with a single backtrack point at the most recent `#`.
///
/// When a literal or `*` fails to line up, the last `#` seen absorbs one
/// more key segment and matching resumes after it. Earlier `#`s never need
/// revisiting: anything they could absorb the later one can absorb too.
fn match_segments(pattern: &[&str], key: &[&str]) -> bool {
    let mut p = 0;
    let mut k = 0;
    // (pattern index just after the `#`, key index it resumes from)
    let mut resume: Option<(usize, usize)> = None;

    while k < key.len() {
        match pattern.get(p) {
            Some(&ANY) => {
                if p + 1 == pattern.len() {
                    return true;
                }
                p += 1;
                resume = Some((p, k));
                continue;
            }
            Some(&segment) if segment == ONE || segment == key[k] => {
                p += 1;
                k += 1;
                continue;
            }
            _ => {}
        }

        match resume {
            Some((after_any, from)) => {
                p = after_any;
                k = from + 1;
                resume = Some((after_any, k));
            }
            None => return false,
        }
    }

    pattern[p..].iter().all(|segment| *segment == ANY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_exactly_one_segment() {
        assert!(topic_matches("stock.*.nyse", "stock.usd.nyse"));
        assert!(!topic_matches("stock.*.nyse", "stock.usd.guest.nyse"));
        assert!(!topic_matches("stock.*.nyse", "stock.nyse"));
        assert!(topic_matches("*", "anything"));
        assert!(!topic_matches("*", "two.words"));
    }

    #[test]
    fn hash_matches_zero_or_more_segments() {
        assert!(topic_matches("stock.#", "stock.usd.nyse"));
        assert!(topic_matches("stock.#", "stock.usd.guest.nyse"));
        assert!(topic_matches("stock.#", "stock"));
        assert!(topic_matches("#", ""));
        assert!(topic_matches("#", "a.b.c"));
        assert!(!topic_matches("stock.#", "bond.usd"));
    }

    #[test]
    fn hash_in_the_middle_backtracks() {
        assert!(topic_matches("a.#.z", "a.z"));
        assert!(topic_matches("a.#.z", "a.b.c.z"));
        assert!(topic_matches("a.#.b.z", "a.b.b.z"));
        assert!(topic_matches("#.b.#", "a.b"));
        assert!(topic_matches("#.*", "a.b.c"));
        assert!(topic_matches("#.*", ""));
        assert!(!topic_matches("a.#.z", "a.b.c"));
        assert!(!topic_matches("a.#.z", "a.z.b"));
    }

    #[test]
    fn literal_segments_must_be_equal() {
        assert!(topic_matches("user.created", "user.created"));
        assert!(!topic_matches("user.created", "user.created.now"));
        assert!(!topic_matches("user.created.now", "user.created"));
        // wildcards embedded in a word are plain text
        assert!(!topic_matches("user*", "users"));
        assert!(topic_matches("user*", "user*"));
    }

    #[test]
    fn empty_segments_are_ordinary_tokens() {
        assert!(topic_matches("", ""));
        assert!(topic_matches("*", ""));
        assert!(topic_matches("a.*.b", "a..b"));
        assert!(!topic_matches("a.b", "a..b"));
        assert!(!topic_matches("", "a"));
    }
}
