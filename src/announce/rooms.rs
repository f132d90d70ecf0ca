//! Fuzzy target-room resolution.
//!
//! Room names are matched with character-bigram Dice similarity over
//! normalized strings. At or above the threshold the best room is picked
//! automatically; otherwise the candidates go back to the user.

use std::collections::HashSet;

/// A scored candidate room.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomMatch {
    pub room_id: String,
    pub name: String,
    pub score: f64,
}

/// Resolution outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomResolution {
    /// Best match cleared the threshold.
    Auto(RoomMatch),
    /// Candidates need user disambiguation, best first (at most three).
    Ambiguous(Vec<RoomMatch>),
    /// Nothing resembles the query.
    NoMatch,
}

/// Lowercase and drop whitespace/punctuation so "研修 チャット" and
/// "研修チャット" compare equal.
fn normalize(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_ascii_punctuation())
        .collect()
}

fn bigrams(text: &str) -> HashSet<(char, char)> {
    let chars: Vec<char> = text.chars().collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}

/// Dice coefficient over character bigrams of the normalized strings.
/// Single-character inputs fall back to exact/containment scoring.
pub fn similarity(a: &str, b: &str) -> f64 {
    let (a, b) = (normalize(a), normalize(b));
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    if a.chars().count() < 2 || b.chars().count() < 2 {
        return if a.contains(&b) || b.contains(&a) { 0.6 } else { 0.0 };
    }
    let (ga, gb) = (bigrams(&a), bigrams(&b));
    let overlap = ga.intersection(&gb).count();
    let total = ga.len().saturating_add(gb.len());
    if total == 0 {
        return 0.0;
    }
    let overlap = u32::try_from(overlap).unwrap_or(u32::MAX);
    let total = u32::try_from(total).unwrap_or(u32::MAX);
    2.0 * f64::from(overlap) / f64::from(total)
}

/// Resolve a query against the tenant's room directory.
pub fn resolve(
    directory: &[(String, String)],
    query: &str,
    threshold: f64,
) -> RoomResolution {
    let mut matches: Vec<RoomMatch> = directory
        .iter()
        .map(|(room_id, name)| {
            // Containment of the query in the room name counts as strong
            // even when the name carries extra decoration.
            let base = similarity(name, query);
            let score = if normalize(name).contains(&normalize(query)) {
                base.max(0.85)
            } else {
                base
            };
            RoomMatch {
                room_id: room_id.clone(),
                name: name.clone(),
                score,
            }
        })
        .filter(|candidate| candidate.score > 0.3)
        .collect();
    matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    match matches.first() {
        None => RoomResolution::NoMatch,
        Some(best) if best.score >= threshold => RoomResolution::Auto(best.clone()),
        Some(_) => {
            matches.truncate(3);
            RoomResolution::Ambiguous(matches)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> Vec<(String, String)> {
        vec![
            ("r1".to_owned(), "研修チャット".to_owned()),
            ("r2".to_owned(), "新人研修 2026".to_owned()),
            ("r3".to_owned(), "営業部".to_owned()),
        ]
    }

    #[test]
    fn identical_names_score_one() {
        assert!((similarity("研修チャット", "研修チャット") - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn whitespace_and_case_ignored() {
        assert!((similarity("Sales Team", "salesteam") - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unrelated_names_score_low() {
        assert!(similarity("研修チャット", "経理部") < 0.2);
    }

    #[test]
    fn exact_containment_auto_picks() {
        match resolve(&directory(), "研修チャット", 0.8) {
            RoomResolution::Auto(room) => assert_eq!(room.room_id, "r1"),
            other => panic!("expected auto, got {other:?}"),
        }
    }

    #[test]
    fn partial_query_matches_both_training_rooms() {
        // "研修" is contained in both training rooms; the boost makes the
        // best one auto-pickable, mirroring the two-candidate scenario
        // where the top match clears 0.8 and the runner-up does not.
        let resolution = resolve(&directory(), "研修", 0.8);
        match resolution {
            RoomResolution::Auto(room) => assert!(room.name.contains("研修")),
            RoomResolution::Ambiguous(candidates) => {
                assert!(candidates.len() >= 2);
                assert!(candidates[0].name.contains("研修"));
            }
            RoomResolution::NoMatch => panic!("should match something"),
        }
    }

    #[test]
    fn below_threshold_is_ambiguous() {
        let directory = vec![
            ("a".to_owned(), "企画部屋".to_owned()),
            ("b".to_owned(), "企画検討".to_owned()),
        ];
        match resolve(&directory, "企画会議", 0.8) {
            RoomResolution::Ambiguous(candidates) => assert!(!candidates.is_empty()),
            other => panic!("expected ambiguous, got {other:?}"),
        }
    }

    #[test]
    fn nothing_matches() {
        assert_eq!(resolve(&directory(), "zzz", 0.8), RoomResolution::NoMatch);
    }
}
