//! "Did you mean" lookups for names the user typed, such as external
//! backend names that have no registration.

pub fn find_best_match<I>(target: &str, candidates: I) -> Option<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let threshold = if target.len() < 3 { 1 } else { 3 };
    let mut best: Option<(usize, String)> = None;

    for candidate in candidates {
        let candidate = candidate.as_ref();
        let distance = levenshtein_distance(target, candidate);
        if distance <= threshold && best.as_ref().is_none_or(|(min, _)| distance < *min) {
            best = Some((distance, candidate.to_string()));
        }
    }

    best.map(|(_, candidate)| candidate)
}

fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let s2_chars: Vec<char> = s2.chars().collect();
    let mut prev: Vec<usize> = (0..=s2_chars.len()).collect();
    let mut row = vec![0; s2_chars.len() + 1];

    for (i, char1) in s1.chars().enumerate() {
        row[0] = i + 1;
        for (j, char2) in s2_chars.iter().enumerate() {
            let cost = usize::from(char1 != *char2);
            row[j + 1] = (prev[j + 1] + 1).min(row[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut row);
    }

    prev[s2_chars.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suggests_close_backend_name() {
        let names = ["codegen.ext.ccompiler", "codegen.ext.dnnl"];
        assert_eq!(
            find_best_match("codegen.ext.ccompile", names).as_deref(),
            Some("codegen.ext.ccompiler")
        );
    }

    #[test]
    fn rejects_distant_names() {
        assert_eq!(find_best_match("cuda", ["codegen.ext.dnnl"]), None);
    }

    #[test]
    fn distance_counts_edits() {
        assert_eq!(levenshtein_distance("kitten", "sitting"), 3);
        assert_eq!(levenshtein_distance("", "abc"), 3);
    }
}
