//! Grading
//!
//! Compares recognized answers with the answer key and produces the final
//! `GradedWorksheet`. Pure: nothing here persists or retries.

use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

use crate::worksheet::{reason, AnswerKey, GradedWorksheet, LetterGrade, ProblemResult, RecognizedAnswer};

/// Grade cutoffs, highest first; anything below the last is `F`
const GRADE_THRESHOLDS: [(f64, LetterGrade); 4] = [
    (0.90, LetterGrade::A),
    (0.80, LetterGrade::B),
    (0.70, LetterGrade::C),
    (0.60, LetterGrade::D),
];

/// Canonical form of an answer string for comparison.
///
/// Trims and lowercases, drops a trailing decimal point, strips redundant
/// leading zeros from the integer part and writes an empty integer part as
/// `0` when a fraction follows. The fraction is kept verbatim. Strings that
/// are not numbers only get the trim/lowercase/trailing-point treatment.
pub fn normalize(s: &str) -> String {
    let lowered = s.trim().to_lowercase();
    let body = lowered.trim_end_matches(|c: char| c == '.' || c.is_whitespace());

    let (sign, unsigned) = match body.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", body.strip_prefix('+').unwrap_or(body)),
    };
    let (int_part, frac) = match unsigned.split_once('.') {
        Some((int_part, frac)) => (int_part, Some(frac)),
        None => (unsigned, None),
    };

    let all_digits = |part: &str| part.chars().all(|c| c.is_ascii_digit());
    let numeric = all_digits(int_part)
        && frac.map_or(true, |f| !f.is_empty() && all_digits(f))
        && !(int_part.is_empty() && frac.is_none());
    if !numeric {
        return body.to_string();
    }

    let stripped = int_part.trim_start_matches('0');
    let int_norm = if stripped.is_empty() { "0" } else { stripped };
    match frac {
        Some(frac) => format!("{}{}.{}", sign, int_norm, frac),
        None => format!("{}{}", sign, int_norm),
    }
}

/// Whether two answers are the same after normalization
pub fn answers_match(expected: &str, recognized: &str) -> bool {
    normalize(expected) == normalize(recognized)
}

/// Letter grade for a score in [0, 1]
pub fn letter_grade(score: f64) -> LetterGrade {
    GRADE_THRESHOLDS
        .iter()
        .find(|(cutoff, _)| score >= *cutoff)
        .map(|(_, grade)| *grade)
        .unwrap_or(LetterGrade::F)
}

/// Seconds since the Unix epoch
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Build the graded record.
///
/// `answers[i]` is the recognition for `key.answers[i]`. Missing entries
/// count as out-of-bounds regions; answers without text are wrong.
pub fn reconcile(key: &AnswerKey, template_id: &str, answers: &[RecognizedAnswer]) -> GradedWorksheet {
    if answers.len() > key.answers.len() {
        warn!(
            "{} recognized answers for {} key entries; ignoring the extra",
            answers.len(),
            key.answers.len()
        );
    }

    let missing = RecognizedAnswer::failed(reason::OUT_OF_BOUNDS);
    let per_problem: Vec<ProblemResult> = key
        .answers
        .iter()
        .enumerate()
        .map(|(i, expected)| {
            let answer = answers.get(i).unwrap_or(&missing);
            let correct = answer
                .text
                .as_deref()
                .map_or(false, |text| answers_match(expected, text));
            ProblemResult {
                expected: expected.clone(),
                recognized: answer.text.clone(),
                correct,
                confidence: answer.confidence,
                error: answer.error.clone(),
            }
        })
        .collect();

    let total_questions = per_problem.len();
    let total_correct = per_problem.iter().filter(|p| p.correct).count();
    let score = if total_questions == 0 {
        0.0
    } else {
        total_correct as f64 / total_questions as f64
    };

    GradedWorksheet {
        id: key.worksheet_id.clone(),
        version: key.version.clone(),
        template_id: template_id.to_string(),
        total_questions,
        total_correct,
        letter_grade: letter_grade(score),
        per_problem,
        graded_at: unix_now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(answers: &[&str]) -> AnswerKey {
        AnswerKey {
            worksheet_id: "ws-1".to_string(),
            version: "2".to_string(),
            answers: answers.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_normalize_examples() {
        assert_eq!(normalize("  007.  "), "7");
        assert_eq!(normalize(".50"), "0.50");
        assert_eq!(normalize("4"), "4");
        assert_eq!(normalize("4."), "4");
        assert_eq!(normalize("000"), "0");
        assert_eq!(normalize("-007.25"), "-7.25");
        assert_eq!(normalize("+12"), "12");
        assert_eq!(normalize("3.10"), "3.10");
        assert_eq!(normalize("  Seven "), "seven");
    }

    #[test]
    fn test_normalize_idempotent() {
        let samples = [
            "  007.  ", ".50", "4.", "", "  ", ".", "-", "+", "-.5", "+.5", "7 .", "1..5", "0.0", "00.10",
            "abc.", "- 5", "+-5", "x1", "12a", "1.2.3", " -0 ", "٣", "ⅷ", "1e5",
        ];
        for s in samples {
            let once = normalize(s);
            assert_eq!(normalize(&once), once, "input {:?}", s);
        }
    }

    #[test]
    fn test_answers_match() {
        assert!(answers_match("12", " 012 "));
        assert!(answers_match("0.5", ".5"));
        assert!(!answers_match("0.5", "0.50"));
        assert!(!answers_match("12", "21"));
    }

    #[test]
    fn test_letter_grade_boundaries() {
        assert_eq!(letter_grade(1.0), LetterGrade::A);
        assert_eq!(letter_grade(0.90), LetterGrade::A);
        assert_eq!(letter_grade(0.8999), LetterGrade::B);
        assert_eq!(letter_grade(0.80), LetterGrade::B);
        assert_eq!(letter_grade(0.75), LetterGrade::C);
        assert_eq!(letter_grade(2.0 / 3.0), LetterGrade::D);
        assert_eq!(letter_grade(0.60), LetterGrade::D);
        assert_eq!(letter_grade(0.59), LetterGrade::F);
        assert_eq!(letter_grade(0.0), LetterGrade::F);
    }

    #[test]
    fn test_reconcile_counts_and_grades() {
        let answers = vec![
            RecognizedAnswer::accepted("4", 0.97),
            RecognizedAnswer::accepted("3", 0.91),
            RecognizedAnswer::accepted("5", 0.95),
            RecognizedAnswer::accepted("12", 0.9),
        ];
        let graded = reconcile(&key(&["4", "8", "5", "12"]), "tpl", &answers);

        assert_eq!(graded.total_questions, 4);
        assert_eq!(graded.total_correct, 3);
        assert_eq!(graded.letter_grade, LetterGrade::C);
        assert!(!graded.per_problem[1].correct);
        assert_eq!(graded.per_problem[1].recognized.as_deref(), Some("3"));
        assert_eq!(graded.template_id, "tpl");
        assert!(graded.graded_at > 0);
    }

    #[test]
    fn test_null_answers_are_wrong_not_errors() {
        let answers = vec![
            RecognizedAnswer::accepted("7", 0.99),
            RecognizedAnswer::accepted("2", 0.98),
            RecognizedAnswer::low_confidence(0.62),
        ];
        let graded = reconcile(&key(&["7", "2", "9"]), "tpl", &answers);

        assert_eq!(graded.total_correct, 2);
        assert_eq!(graded.letter_grade, LetterGrade::D);
        let low = &graded.per_problem[2];
        assert!(low.recognized.is_none());
        assert!((low.confidence - 0.62).abs() < 1e-6);
        assert_eq!(low.error.as_deref(), Some("low_confidence"));
    }

    #[test]
    fn test_missing_answers_count_as_out_of_bounds() {
        let answers = vec![RecognizedAnswer::accepted("1", 0.9)];
        let graded = reconcile(&key(&["1", "2"]), "tpl", &answers);

        assert_eq!(graded.total_correct, 1);
        assert_eq!(graded.per_problem[1].error.as_deref(), Some("region_out_of_bounds"));
    }

    #[test]
    fn test_zero_problem_worksheet() {
        let graded = reconcile(&key(&[]), "tpl", &[]);
        assert_eq!(graded.total_questions, 0);
        assert_eq!(graded.score(), 0.0);
        assert_eq!(graded.letter_grade, LetterGrade::F);
    }

    #[test]
    fn test_all_correct_is_a() {
        let answers: Vec<RecognizedAnswer> = (0..7).map(|d| RecognizedAnswer::accepted(d.to_string(), 0.9)).collect();
        let expected: Vec<String> = (0..7).map(|d| d.to_string()).collect();
        let expected: Vec<&str> = expected.iter().map(String::as_str).collect();
        let graded = reconcile(&key(&expected), "tpl", &answers);

        assert_eq!(graded.total_correct, graded.total_questions);
        assert_eq!(graded.letter_grade, LetterGrade::A);
    }
}
