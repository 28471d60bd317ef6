use crate::scale::{GradeBand, SortedGradeScale};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Round to a whole percentage, halves going up: `Int(x + 0.5)`.
pub fn round_half_up(x: f64) -> u32 {
    let r = (x + 0.5).floor();
    if r <= 0.0 {
        0
    } else {
        r as u32
    }
}

/// 1-decimal rounding with the same half-up rule: `Int(10*x + 0.5) / 10`.
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

pub fn percent_of(part: f64, whole: f64) -> u32 {
    if whole > 0.0 {
        round_half_up(100.0 * part / whole)
    } else {
        0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectDefinition {
    pub id: String,
    pub label: String,
    pub max_marks: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawScore {
    pub subject_id: String,
    pub marks: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentInfo {
    pub student_id: String,
    pub registration_no: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassKey {
    pub grade: String,
    pub term: i64,
    pub academic_year: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectScore {
    pub subject_id: String,
    pub label: String,
    pub raw_marks: f64,
    pub max_marks: u32,
    pub percentage: u32,
    pub grade: GradeBand,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentResult {
    pub student_id: String,
    pub registration_no: String,
    pub display_name: String,
    pub subjects: Vec<SubjectScore>,
    pub total_marks: f64,
    pub total_possible: u32,
    pub overall_percentage: u32,
    pub overall_grade: GradeBand,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MarkError {
    #[error("student {student_id}: {marks} marks in {subject_id} is outside 0..={max_marks}")]
    OutOfRange {
        student_id: String,
        subject_id: String,
        marks: f64,
        max_marks: u32,
    },
    #[error("student {student_id}: subject {subject_id} has more than one mark")]
    DuplicateSubject {
        student_id: String,
        subject_id: String,
    },
    #[error("percentage {percentage} is not covered by the grade scale")]
    Unclassified { percentage: u32 },
}

impl MarkError {
    pub fn code(&self) -> &'static str {
        match self {
            MarkError::OutOfRange { .. } | MarkError::DuplicateSubject { .. } => "invalid_mark",
            MarkError::Unclassified { .. } => "invalid_scale",
        }
    }

    pub fn details(&self) -> serde_json::Value {
        match self {
            MarkError::OutOfRange {
                student_id,
                subject_id,
                marks,
                max_marks,
            } => serde_json::json!({
                "studentId": student_id,
                "subjectId": subject_id,
                "marks": marks,
                "maxMarks": max_marks,
            }),
            MarkError::DuplicateSubject {
                student_id,
                subject_id,
            } => serde_json::json!({
                "studentId": student_id,
                "subjectId": subject_id,
            }),
            MarkError::Unclassified { percentage } => serde_json::json!({
                "percentage": percentage,
            }),
        }
    }
}

pub fn validate_marks(marks: f64, max_marks: u32) -> bool {
    marks.is_finite() && marks >= 0.0 && marks <= f64::from(max_marks)
}

fn band_for(scale: &SortedGradeScale, percentage: u32) -> Result<GradeBand, MarkError> {
    scale
        .classify(f64::from(percentage))
        .cloned()
        .ok_or(MarkError::Unclassified { percentage })
}

/// Builds one student's result from raw marks.
///
/// Scores for subjects missing from `subjects` are skipped. Any mark outside
/// `0..=max_marks` rejects the whole record: clamping would distort totals
/// and therefore positions.
pub fn aggregate(
    student: &StudentInfo,
    raw: &[RawScore],
    subjects: &[SubjectDefinition],
    scale: &SortedGradeScale,
) -> Result<StudentResult, MarkError> {
    let by_id: HashMap<&str, &SubjectDefinition> =
        subjects.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut seen: HashSet<&str> = HashSet::new();
    let mut scores = Vec::with_capacity(raw.len());
    let mut total_marks = 0.0_f64;
    let mut total_possible = 0_u32;

    for r in raw {
        let Some(def) = by_id.get(r.subject_id.as_str()) else {
            continue;
        };
        if !seen.insert(def.id.as_str()) {
            return Err(MarkError::DuplicateSubject {
                student_id: student.student_id.clone(),
                subject_id: def.id.clone(),
            });
        }
        if !validate_marks(r.marks, def.max_marks) {
            return Err(MarkError::OutOfRange {
                student_id: student.student_id.clone(),
                subject_id: def.id.clone(),
                marks: r.marks,
                max_marks: def.max_marks,
            });
        }

        let percentage = percent_of(r.marks, f64::from(def.max_marks));
        scores.push(SubjectScore {
            subject_id: def.id.clone(),
            label: def.label.clone(),
            raw_marks: r.marks,
            max_marks: def.max_marks,
            percentage,
            grade: band_for(scale, percentage)?,
        });
        total_marks += r.marks;
        total_possible += def.max_marks;
    }

    let overall_percentage = percent_of(total_marks, f64::from(total_possible));
    Ok(StudentResult {
        student_id: student.student_id.clone(),
        registration_no: student.registration_no.clone(),
        display_name: student.display_name.clone(),
        subjects: scores,
        total_marks,
        total_possible,
        overall_percentage,
        overall_grade: band_for(scale, overall_percentage)?,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RankPolicy {
    /// Tied totals take consecutive positions in input order (1, 2, 3).
    #[default]
    Sequential,
    /// Tied totals share a position and the next one skips (1, 1, 3).
    Competition,
}

impl RankPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sequential" => Some(Self::Sequential),
            "competition" => Some(Self::Competition),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Competition => "competition",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisOptions {
    pub rank_policy: RankPolicy,
    pub performer_count: usize,
    pub highlight_count: usize,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            rank_policy: RankPolicy::Sequential,
            performer_count: 5,
            highlight_count: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedStudent {
    pub position: u32,
    #[serde(flatten)]
    pub result: StudentResult,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAverage {
    pub subject_id: String,
    pub label: String,
    pub average_percentage: f64,
    pub attempted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BandCount {
    pub letter: String,
    pub descriptor: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformerSummary {
    pub student_id: String,
    pub display_name: String,
    pub position: u32,
    pub total_marks: f64,
    pub overall_percentage: u32,
    pub grade_letter: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassMetrics {
    pub grade: String,
    pub term: i64,
    pub academic_year: i64,
    pub total_students: usize,
    pub average_percentage: u32,
    pub pass_rate: u32,
    pub subject_averages: Vec<SubjectAverage>,
    pub grade_distribution: Vec<BandCount>,
    pub top_performers: Vec<PerformerSummary>,
    pub bottom_performers: Vec<PerformerSummary>,
    pub subject_strengths: Vec<SubjectAverage>,
    pub subject_weaknesses: Vec<SubjectAverage>,
}

impl ClassMetrics {
    pub fn subject_average(&self, subject_id: &str) -> Option<&SubjectAverage> {
        self.subject_averages
            .iter()
            .find(|s| s.subject_id == subject_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassAnalysis {
    pub ranked: Vec<RankedStudent>,
    pub metrics: ClassMetrics,
}

fn assign_positions(results: Vec<StudentResult>, policy: RankPolicy) -> Vec<RankedStudent> {
    let mut sorted = results;
    // Stable: equal totals keep their input order.
    sorted.sort_by(|a, b| b.total_marks.total_cmp(&a.total_marks));

    let mut out: Vec<RankedStudent> = Vec::with_capacity(sorted.len());
    for (i, result) in sorted.into_iter().enumerate() {
        let sequential = (i + 1) as u32;
        let position = match (policy, out.last()) {
            (RankPolicy::Competition, Some(prev))
                if prev.result.total_marks == result.total_marks =>
            {
                prev.position
            }
            _ => sequential,
        };
        out.push(RankedStudent { position, result });
    }
    out
}

fn summarize(r: &RankedStudent) -> PerformerSummary {
    PerformerSummary {
        student_id: r.result.student_id.clone(),
        display_name: r.result.display_name.clone(),
        position: r.position,
        total_marks: r.result.total_marks,
        overall_percentage: r.result.overall_percentage,
        grade_letter: r.result.overall_grade.letter.clone(),
    }
}

fn compute_subject_averages(
    ranked: &[RankedStudent],
    subjects: &[SubjectDefinition],
) -> Vec<SubjectAverage> {
    // subject id -> (sum of percentages, attempts, first label seen)
    let mut totals: HashMap<&str, (u64, usize, &str)> = HashMap::new();
    for r in ranked {
        for s in &r.result.subjects {
            let entry = totals
                .entry(s.subject_id.as_str())
                .or_insert((0, 0, s.label.as_str()));
            entry.0 += u64::from(s.percentage);
            entry.1 += 1;
        }
    }

    let known: HashMap<&str, usize> = subjects
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut out: Vec<(Option<usize>, SubjectAverage)> = totals
        .into_iter()
        .map(|(id, (sum, count, seen_label))| {
            let order = known.get(id).copied();
            let label = order
                .and_then(|i| subjects.get(i))
                .map(|s| s.label.clone())
                .unwrap_or_else(|| seen_label.to_string());
            let average_percentage = if count > 0 {
                round_off_1_decimal(sum as f64 / count as f64)
            } else {
                0.0
            };
            (
                order,
                SubjectAverage {
                    subject_id: id.to_string(),
                    label,
                    average_percentage,
                    attempted: count,
                },
            )
        })
        .collect();

    // Definition order first; subjects only seen in results follow, by id.
    out.sort_by(|(ao, a), (bo, b)| match (ao, bo) {
        (Some(x), Some(y)) => x.cmp(y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.subject_id.cmp(&b.subject_id),
    });
    out.into_iter().map(|(_, avg)| avg).collect()
}

/// Ranks a class by total marks and derives the class-wide metrics.
///
/// An empty `results` list is a valid class: every count and average is 0 and
/// the grade distribution still lists every band of `scale`.
pub fn analyze(
    key: &ClassKey,
    results: Vec<StudentResult>,
    subjects: &[SubjectDefinition],
    scale: &SortedGradeScale,
    options: &AnalysisOptions,
) -> ClassAnalysis {
    let ranked = assign_positions(results, options.rank_policy);
    let total_students = ranked.len();

    let average_percentage = if total_students > 0 {
        let sum: u64 = ranked
            .iter()
            .map(|r| u64::from(r.result.overall_percentage))
            .sum();
        round_half_up(sum as f64 / total_students as f64)
    } else {
        0
    };

    let passing = scale.passing_letters();
    let passed = ranked
        .iter()
        .filter(|r| passing.contains(&r.result.overall_grade.letter.as_str()))
        .count();
    let pass_rate = percent_of(passed as f64, total_students as f64);

    let grade_distribution = scale
        .bands()
        .iter()
        .map(|b| BandCount {
            letter: b.letter.clone(),
            descriptor: b.descriptor.clone(),
            count: ranked
                .iter()
                .filter(|r| r.result.overall_grade.letter == b.letter)
                .count(),
        })
        .collect();

    let subject_averages = compute_subject_averages(&ranked, subjects);

    let mut strengths = subject_averages.clone();
    strengths.sort_by(|a, b| b.average_percentage.total_cmp(&a.average_percentage));
    strengths.truncate(options.highlight_count);

    let mut weaknesses = subject_averages.clone();
    weaknesses.sort_by(|a, b| a.average_percentage.total_cmp(&b.average_percentage));
    weaknesses.truncate(options.highlight_count);

    let top_performers = ranked
        .iter()
        .take(options.performer_count)
        .map(summarize)
        .collect();
    let bottom_performers = ranked
        .iter()
        .rev()
        .take(options.performer_count)
        .map(summarize)
        .collect();

    let metrics = ClassMetrics {
        grade: key.grade.clone(),
        term: key.term,
        academic_year: key.academic_year,
        total_students,
        average_percentage,
        pass_rate,
        subject_averages,
        grade_distribution,
        top_performers,
        bottom_performers,
        subject_strengths: strengths,
        subject_weaknesses: weaknesses,
    };

    ClassAnalysis { ranked, metrics }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCardLine {
    pub subject_id: String,
    pub label: String,
    pub raw_marks: f64,
    pub max_marks: u32,
    pub percentage: u32,
    pub grade_letter: String,
    pub grade_descriptor: String,
    pub points: i32,
    pub class_average: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCard {
    pub grade: String,
    pub term: i64,
    pub academic_year: i64,
    pub student_id: String,
    pub registration_no: String,
    pub display_name: String,
    pub position: u32,
    pub class_size: usize,
    pub total_marks: f64,
    pub total_possible: u32,
    pub overall_percentage: u32,
    pub overall_grade: GradeBand,
    pub total_points: i32,
    pub class_average_percentage: u32,
    pub lines: Vec<ReportCardLine>,
}

/// One student's card out of an already computed class analysis.
pub fn report_card(analysis: &ClassAnalysis, student_id: &str) -> Option<ReportCard> {
    let ranked = analysis
        .ranked
        .iter()
        .find(|r| r.result.student_id == student_id)?;
    let m = &analysis.metrics;
    let r = &ranked.result;

    let lines: Vec<ReportCardLine> = r
        .subjects
        .iter()
        .map(|s| ReportCardLine {
            subject_id: s.subject_id.clone(),
            label: s.label.clone(),
            raw_marks: s.raw_marks,
            max_marks: s.max_marks,
            percentage: s.percentage,
            grade_letter: s.grade.letter.clone(),
            grade_descriptor: s.grade.descriptor.clone(),
            points: s.grade.points,
            class_average: m.subject_average(&s.subject_id).map(|a| a.average_percentage),
        })
        .collect();

    Some(ReportCard {
        grade: m.grade.clone(),
        term: m.term,
        academic_year: m.academic_year,
        student_id: r.student_id.clone(),
        registration_no: r.registration_no.clone(),
        display_name: r.display_name.clone(),
        position: ranked.position,
        class_size: m.total_students,
        total_marks: r.total_marks,
        total_possible: r.total_possible,
        overall_percentage: r.overall_percentage,
        overall_grade: r.overall_grade.clone(),
        total_points: lines.iter().map(|l| l.points).sum(),
        class_average_percentage: m.average_percentage,
        lines,
    })
}
