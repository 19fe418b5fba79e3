//! Candidate ranking for identifier fixes.

use crate::domain::proposal::MatchQuality;

/// Case-insensitive optimal-string-alignment distance.
///
/// Counts insertions, deletions, substitutions and adjacent transpositions.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();
    let (n, m) = (a.len(), b.len());
    if n == 0 {
        return m;
    }
    if m == 0 {
        return n;
    }

    let mut d = vec![vec![0usize; m + 1]; n + 1];
    for (i, row) in d.iter_mut().enumerate() {
        row[0] = i;
    }
    for j in 0..=m {
        d[0][j] = j;
    }

    for i in 1..=n {
        for j in 1..=m {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            let mut best = (d[i - 1][j] + 1)
                .min(d[i][j - 1] + 1)
                .min(d[i - 1][j - 1] + cost);
            if i > 1 && j > 1 && a[i - 1] == b[j - 2] && a[i - 2] == b[j - 1] {
                best = best.min(d[i - 2][j - 2] + 1);
            }
            d[i][j] = best;
        }
    }
    d[n][m]
}

/// Largest distance at which two names still count as similarly named.
pub fn similarity_threshold(a: &str, b: &str) -> usize {
    let longer = a.chars().count().max(b.chars().count());
    (longer / 3).max(2)
}

/// The chosen replacement for an offending identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateMatch {
    pub candidate: String,
    pub distance: usize,
    pub quality: MatchQuality,
    /// How many candidates were similar enough to consider.
    pub considered: usize,
}

/// Pick the most likely replacement for `subject` among `candidates`.
///
/// - one case-insensitive match: `Exact`
/// - exactly one similarly-named candidate: `Sole`
/// - several similar, unique best within distance 2: `Near`
/// - ties or a weak best: `Ambiguous` (lexicographically first best)
///
/// Returns `None` when nothing is similar. A candidate spelled exactly
/// like `subject` is ignored since it cannot be the fix.
pub fn best_match(subject: &str, candidates: &[String]) -> Option<CandidateMatch> {
    let mut pool: Vec<&str> = candidates
        .iter()
        .map(String::as_str)
        .filter(|c| !c.is_empty() && *c != subject)
        .collect();
    pool.sort_unstable();
    pool.dedup();

    let exact: Vec<&str> = pool
        .iter()
        .copied()
        .filter(|c| c.eq_ignore_ascii_case(subject))
        .collect();
    if let Some(first) = exact.first() {
        let quality = if exact.len() == 1 {
            MatchQuality::Exact
        } else {
            MatchQuality::Ambiguous
        };
        return Some(CandidateMatch {
            candidate: (*first).to_string(),
            distance: 0,
            quality,
            considered: exact.len(),
        });
    }

    let mut similar: Vec<(usize, &str)> = pool
        .iter()
        .map(|c| (edit_distance(subject, c), *c))
        .filter(|(d, c)| *d <= similarity_threshold(subject, c))
        .collect();
    similar.sort();

    let (best_distance, best) = *similar.first()?;
    let quality = match similar.get(1) {
        None => MatchQuality::Sole,
        Some((runner_up, _)) if *runner_up == best_distance => MatchQuality::Ambiguous,
        Some(_) if best_distance <= 2 => MatchQuality::Near,
        Some(_) => MatchQuality::Ambiguous,
    };

    Some(CandidateMatch {
        candidate: best.to_string(),
        distance: best_distance,
        quality,
        considered: similar.len(),
    })
}
