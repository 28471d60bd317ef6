use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Number of highest-scoring bands that count as a pass.
pub const PASS_BAND_COUNT: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBand {
    pub letter: String,
    pub descriptor: String,
    pub points: i32,
    pub min_percentage: u8,
    pub max_percentage: u8,
}

impl GradeBand {
    pub fn new(letter: &str, descriptor: &str, points: i32, min: u8, max: u8) -> Self {
        Self {
            letter: letter.to_string(),
            descriptor: descriptor.to_string(),
            points,
            min_percentage: min,
            max_percentage: max,
        }
    }

    pub fn contains(&self, percentage: f64) -> bool {
        f64::from(self.min_percentage) <= percentage && percentage <= f64::from(self.max_percentage)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScaleError {
    #[error("grade scale must contain at least one band")]
    Empty,
    #[error("band {letter:?} has a blank letter")]
    BlankLetter { letter: String },
    #[error("band letter {0:?} appears more than once")]
    DuplicateLetter(String),
    #[error("band {letter:?} has min {min} above max {max}")]
    InvertedBounds { letter: String, min: u8, max: u8 },
    #[error("band {letter:?} ends at {max}, above 100")]
    AboveHundred { letter: String, max: u8 },
    #[error("highest band {letter:?} ends at {max}; the scale must reach 100")]
    TopNotHundred { letter: String, max: u8 },
    #[error("lowest band {letter:?} starts at {min}; the scale must start at 0")]
    BottomNotZero { letter: String, min: u8 },
    #[error("gap between band {upper:?} and band {lower:?}")]
    Gap { upper: String, lower: String },
    #[error("band {upper:?} overlaps band {lower:?}")]
    Overlap { upper: String, lower: String },
}

impl ScaleError {
    pub fn code(&self) -> &'static str {
        "invalid_scale"
    }
}

/// A grade scale that has been sorted descending by `min_percentage` and
/// checked to partition [0, 100] with no gaps and no overlaps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SortedGradeScale {
    bands: Vec<GradeBand>,
}

impl SortedGradeScale {
    pub fn new(mut bands: Vec<GradeBand>) -> Result<Self, ScaleError> {
        if bands.is_empty() {
            return Err(ScaleError::Empty);
        }

        let mut seen = HashSet::new();
        for b in &bands {
            if b.letter.trim().is_empty() {
                return Err(ScaleError::BlankLetter {
                    letter: b.letter.clone(),
                });
            }
            if !seen.insert(b.letter.as_str()) {
                return Err(ScaleError::DuplicateLetter(b.letter.clone()));
            }
            if b.min_percentage > b.max_percentage {
                return Err(ScaleError::InvertedBounds {
                    letter: b.letter.clone(),
                    min: b.min_percentage,
                    max: b.max_percentage,
                });
            }
            if b.max_percentage > 100 {
                return Err(ScaleError::AboveHundred {
                    letter: b.letter.clone(),
                    max: b.max_percentage,
                });
            }
        }

        bands.sort_by(|a, b| b.min_percentage.cmp(&a.min_percentage));

        for pair in bands.windows(2) {
            let (upper, lower) = (&pair[0], &pair[1]);
            let expected_max = i32::from(upper.min_percentage) - 1;
            let lower_max = i32::from(lower.max_percentage);
            if lower_max < expected_max {
                return Err(ScaleError::Gap {
                    upper: upper.letter.clone(),
                    lower: lower.letter.clone(),
                });
            }
            if lower_max > expected_max {
                return Err(ScaleError::Overlap {
                    upper: upper.letter.clone(),
                    lower: lower.letter.clone(),
                });
            }
        }

        let top = &bands[0];
        if top.max_percentage != 100 {
            return Err(ScaleError::TopNotHundred {
                letter: top.letter.clone(),
                max: top.max_percentage,
            });
        }
        let bottom = &bands[bands.len() - 1];
        if bottom.min_percentage != 0 {
            return Err(ScaleError::BottomNotZero {
                letter: bottom.letter.clone(),
                min: bottom.min_percentage,
            });
        }

        Ok(Self { bands })
    }

    /// CBC four-band scale: EE 80-100, ME 50-79, AE 40-49, BE 0-39.
    pub fn cbc_default() -> Self {
        Self {
            bands: default_cbc_bands(),
        }
    }

    pub fn bands(&self) -> &[GradeBand] {
        &self.bands
    }

    pub fn lowest(&self) -> &GradeBand {
        // Construction guarantees at least one band.
        &self.bands[self.bands.len() - 1]
    }

    /// First band (highest first) whose inclusive bounds contain `percentage`.
    pub fn classify(&self, percentage: f64) -> Option<&GradeBand> {
        if !percentage.is_finite() {
            return None;
        }
        self.bands.iter().find(|b| b.contains(percentage))
    }

    /// Like [`classify`](Self::classify) but degrades to the lowest band when
    /// nothing matches, for callers that treat out-of-range input as failing.
    pub fn classify_or_lowest(&self, percentage: f64) -> &GradeBand {
        self.classify(percentage).unwrap_or_else(|| self.lowest())
    }

    /// Letters of the top [`PASS_BAND_COUNT`] bands ranked by points.
    pub fn passing_letters(&self) -> Vec<&str> {
        let mut by_points: Vec<&GradeBand> = self.bands.iter().collect();
        by_points.sort_by(|a, b| b.points.cmp(&a.points));
        by_points
            .into_iter()
            .take(PASS_BAND_COUNT)
            .map(|b| b.letter.as_str())
            .collect()
    }
}

impl Default for SortedGradeScale {
    fn default() -> Self {
        Self::cbc_default()
    }
}

impl<'de> Deserialize<'de> for SortedGradeScale {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bands = Vec::<GradeBand>::deserialize(deserializer)?;
        SortedGradeScale::new(bands).map_err(serde::de::Error::custom)
    }
}

pub fn default_cbc_bands() -> Vec<GradeBand> {
    vec![
        GradeBand::new("EE", "Exceeding Expectation", 4, 80, 100),
        GradeBand::new("ME", "Meeting Expectation", 3, 50, 79),
        GradeBand::new("AE", "Approaching Expectation", 2, 40, 49),
        GradeBand::new("BE", "Below Expectation", 1, 0, 39),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn letter(scale: &SortedGradeScale, p: f64) -> Option<&str> {
        scale.classify(p).map(|b| b.letter.as_str())
    }

    #[test]
    fn default_scale_boundaries() {
        let s = SortedGradeScale::cbc_default();
        assert_eq!(letter(&s, 100.0), Some("EE"));
        assert_eq!(letter(&s, 80.0), Some("EE"));
        assert_eq!(letter(&s, 79.0), Some("ME"));
        assert_eq!(letter(&s, 50.0), Some("ME"));
        assert_eq!(letter(&s, 49.0), Some("AE"));
        assert_eq!(letter(&s, 40.0), Some("AE"));
        assert_eq!(letter(&s, 39.0), Some("BE"));
        assert_eq!(letter(&s, 0.0), Some("BE"));
    }

    #[test]
    fn default_scale_passes_validation() {
        let rebuilt = SortedGradeScale::new(default_cbc_bands()).expect("valid default");
        assert_eq!(rebuilt, SortedGradeScale::cbc_default());
    }

    #[test]
    fn every_integer_percentage_lands_in_exactly_one_band() {
        let s = SortedGradeScale::cbc_default();
        for p in 0..=100u8 {
            let p = f64::from(p);
            let hits = s.bands().iter().filter(|b| b.contains(p)).count();
            assert_eq!(hits, 1, "percentage {p}");
            let band = s.classify(p).expect("band");
            assert!(band.contains(p));
        }
    }

    #[test]
    fn out_of_range_is_none_but_fallback_is_lowest() {
        let s = SortedGradeScale::cbc_default();
        assert_eq!(letter(&s, 101.0), None);
        assert_eq!(letter(&s, -1.0), None);
        assert_eq!(letter(&s, f64::NAN), None);
        assert_eq!(s.classify_or_lowest(101.0).letter, "BE");
        assert_eq!(s.classify_or_lowest(f64::INFINITY).letter, "BE");
    }

    #[test]
    fn fractional_percentages_between_integer_bounds_do_not_match() {
        let s = SortedGradeScale::cbc_default();
        assert_eq!(letter(&s, 79.5), None);
        assert_eq!(letter(&s, 79.0), Some("ME"));
    }

    #[test]
    fn unsorted_input_is_sorted_on_construction() {
        let mut bands = default_cbc_bands();
        bands.reverse();
        let s = SortedGradeScale::new(bands).expect("valid");
        let order: Vec<&str> = s.bands().iter().map(|b| b.letter.as_str()).collect();
        assert_eq!(order, vec!["EE", "ME", "AE", "BE"]);
    }

    #[test]
    fn gaps_and_overlaps_are_rejected() {
        let gap = vec![
            GradeBand::new("A", "High", 2, 60, 100),
            GradeBand::new("B", "Low", 1, 0, 50),
        ];
        assert!(matches!(
            SortedGradeScale::new(gap),
            Err(ScaleError::Gap { .. })
        ));

        let overlap = vec![
            GradeBand::new("A", "High", 2, 50, 100),
            GradeBand::new("B", "Low", 1, 0, 50),
        ];
        assert!(matches!(
            SortedGradeScale::new(overlap),
            Err(ScaleError::Overlap { .. })
        ));
    }

    #[test]
    fn coverage_and_shape_errors() {
        assert_eq!(SortedGradeScale::new(vec![]), Err(ScaleError::Empty));
        assert!(matches!(
            SortedGradeScale::new(vec![GradeBand::new("A", "", 1, 0, 90)]),
            Err(ScaleError::TopNotHundred { .. })
        ));
        assert!(matches!(
            SortedGradeScale::new(vec![GradeBand::new("A", "", 1, 10, 100)]),
            Err(ScaleError::BottomNotZero { .. })
        ));
        assert!(matches!(
            SortedGradeScale::new(vec![GradeBand::new("A", "", 1, 0, 120)]),
            Err(ScaleError::AboveHundred { .. })
        ));
        assert!(matches!(
            SortedGradeScale::new(vec![GradeBand::new("A", "", 1, 60, 40)]),
            Err(ScaleError::InvertedBounds { .. })
        ));
        assert!(matches!(
            SortedGradeScale::new(vec![
                GradeBand::new("A", "", 2, 50, 100),
                GradeBand::new("A", "", 1, 0, 49),
            ]),
            Err(ScaleError::DuplicateLetter(_))
        ));
        assert!(matches!(
            SortedGradeScale::new(vec![GradeBand::new(" ", "", 1, 0, 100)]),
            Err(ScaleError::BlankLetter { .. })
        ));
    }

    #[test]
    fn passing_letters_follow_points_not_position() {
        let s = SortedGradeScale::cbc_default();
        assert_eq!(s.passing_letters(), vec!["EE", "ME"]);

        let odd = SortedGradeScale::new(vec![
            GradeBand::new("X", "", 1, 70, 100),
            GradeBand::new("Y", "", 5, 30, 69),
            GradeBand::new("Z", "", 3, 0, 29),
        ])
        .expect("valid");
        assert_eq!(odd.passing_letters(), vec!["Y", "Z"]);

        let single = SortedGradeScale::new(vec![GradeBand::new("P", "", 1, 0, 100)]).expect("valid");
        assert_eq!(single.passing_letters(), vec!["P"]);
    }

    #[test]
    fn deserializing_validates() {
        let ok: SortedGradeScale = serde_json::from_value(serde_json::json!([
            { "letter": "P", "descriptor": "Pass", "points": 2, "minPercentage": 50, "maxPercentage": 100 },
            { "letter": "F", "descriptor": "Fail", "points": 1, "minPercentage": 0, "maxPercentage": 49 }
        ]))
        .expect("valid scale");
        assert_eq!(ok.bands().len(), 2);

        let bad = serde_json::from_value::<SortedGradeScale>(serde_json::json!([
            { "letter": "P", "descriptor": "Pass", "points": 2, "minPercentage": 60, "maxPercentage": 100 },
            { "letter": "F", "descriptor": "Fail", "points": 1, "minPercentage": 0, "maxPercentage": 49 }
        ]));
        assert!(bad.is_err());
    }
}
