use serde::{Deserialize, Serialize};

pub const LIKERT_LEN: usize = 5;

const TOTAL_CENTS: i64 = 10_000;
const CENT_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LikertLabel {
    StronglyAgree,
    SlightlyAgree,
    NeitherAgreeNorDisagree,
    SlightlyDisagree,
    StronglyDisagree,
}

impl LikertLabel {
    pub const ALL: [LikertLabel; LIKERT_LEN] = [
        Self::StronglyAgree,
        Self::SlightlyAgree,
        Self::NeitherAgreeNorDisagree,
        Self::SlightlyDisagree,
        Self::StronglyDisagree,
    ];

    pub fn index(self) -> usize {
        match self {
            Self::StronglyAgree => 0,
            Self::SlightlyAgree => 1,
            Self::NeitherAgreeNorDisagree => 2,
            Self::SlightlyDisagree => 3,
            Self::StronglyDisagree => 4,
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Self::StronglyAgree => "strongly_agree",
            Self::SlightlyAgree => "slightly_agree",
            Self::NeitherAgreeNorDisagree => "neither_agree_nor_disagree",
            Self::SlightlyDisagree => "slightly_disagree",
            Self::StronglyDisagree => "strongly_disagree",
        }
    }

    pub fn pretty(self) -> &'static str {
        match self {
            Self::StronglyAgree => "Strongly agree",
            Self::SlightlyAgree => "Slightly agree",
            Self::NeitherAgreeNorDisagree => "Neither agree nor disagree",
            Self::SlightlyDisagree => "Slightly disagree",
            Self::StronglyDisagree => "Strongly disagree",
        }
    }
}

/// Percentages over the five Likert labels. Values are non-negative, carry at most two
/// decimals and sum to exactly 100.00; the only constructors are the rounding functions below.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(into = "LikertFields")]
pub struct Distribution {
    values: [f64; LIKERT_LEN],
}

impl Distribution {
    pub fn equal_split() -> Self {
        Self {
            values: [100.0 / LIKERT_LEN as f64; LIKERT_LEN],
        }
    }

    pub fn get(&self, label: LikertLabel) -> f64 {
        self.values[label.index()]
    }

    pub fn values(&self) -> [f64; LIKERT_LEN] {
        self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (LikertLabel, f64)> + '_ {
        LikertLabel::ALL
            .iter()
            .map(|label| (*label, self.values[label.index()]))
    }

    /// Strongly agree + slightly agree.
    pub fn topline(&self) -> f64 {
        round_cents(self.get(LikertLabel::StronglyAgree) + self.get(LikertLabel::SlightlyAgree))
    }

    pub fn total(&self) -> f64 {
        round_cents(self.values.iter().sum())
    }

    pub fn format_lines(&self) -> String {
        self.iter()
            .map(|(label, value)| format!("{}: {value:.2}%", label.pretty()))
            .collect::<Vec<String>>()
            .join("\n")
    }

    pub fn format_inline(&self) -> String {
        self.iter()
            .map(|(label, value)| format!("{}={value:.2}%", label.pretty()))
            .collect::<Vec<String>>()
            .join(", ")
    }
}

/// Wire shape of a distribution: one field per label. Missing fields read as zero; unknown
/// keys are rejected so a misspelled label cannot silently become zero.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LikertFields {
    pub strongly_agree: f64,
    pub slightly_agree: f64,
    #[serde(alias = "neither")]
    pub neither_agree_nor_disagree: f64,
    pub slightly_disagree: f64,
    pub strongly_disagree: f64,
}

impl LikertFields {
    pub fn to_array(self) -> [f64; LIKERT_LEN] {
        [
            self.strongly_agree,
            self.slightly_agree,
            self.neither_agree_nor_disagree,
            self.slightly_disagree,
            self.strongly_disagree,
        ]
    }
}

impl From<Distribution> for LikertFields {
    fn from(value: Distribution) -> Self {
        let [sa, a, n, sd, sdd] = value.values;
        Self {
            strongly_agree: sa,
            slightly_agree: a,
            neither_agree_nor_disagree: n,
            slightly_disagree: sd,
            strongly_disagree: sdd,
        }
    }
}

/// Rounds to hundredths while forcing the total to exactly 100.00.
///
/// Inputs are first rescaled to shares of 100, so the leftover after flooring every value to
/// whole hundredths is at most a few hundredths. Those go to the labels with the largest
/// fractional remainder, ties going to the earlier label. An input with nothing positive in it
/// becomes the equal split.
pub fn largest_remainder_round(values: [f64; LIKERT_LEN]) -> Distribution {
    let clipped = values.map(clip_non_negative);
    let peak = clipped.iter().copied().fold(0.0_f64, f64::max);
    if peak <= 0.0 {
        return Distribution::equal_split();
    }
    // Dividing by the peak first keeps the sum finite for very large inputs.
    let relative = clipped.map(|value| value / peak);
    let total = relative.iter().sum::<f64>();

    let mut cents = [0_i64; LIKERT_LEN];
    let mut fractions = [0_f64; LIKERT_LEN];
    for (index, value) in relative.iter().enumerate() {
        let scaled = value / total * TOTAL_CENTS as f64;
        let floored = (scaled + CENT_EPSILON).floor();
        cents[index] = floored as i64;
        fractions[index] = (scaled - floored).max(0.0);
    }

    // The floors never overshoot the rescaled total, so the leftover is between 0 and 4 cents.
    let remainder = (TOTAL_CENTS - cents.iter().sum::<i64>()).max(0) as usize;
    let mut order = (0..LIKERT_LEN).collect::<Vec<usize>>();
    order.sort_by(|left, right| fractions[*right].total_cmp(&fractions[*left]));
    for index in order.iter().cycle().take(remainder) {
        cents[*index] += 1;
    }

    Distribution {
        values: cents.map(|value| value as f64 / 100.0),
    }
}

/// Clips negative or non-finite entries to zero, rescales to 100 and rounds.
/// An all-zero input becomes the equal split.
pub fn normalise_distribution(raw: [f64; LIKERT_LEN]) -> Distribution {
    largest_remainder_round(raw)
}

/// Per-label arithmetic mean, rounded again so the aggregate also sums to exactly 100.00.
pub fn mean_distribution(items: &[Distribution]) -> Option<Distribution> {
    if items.is_empty() {
        return None;
    }

    let mut sums = [0_f64; LIKERT_LEN];
    for item in items {
        for (index, value) in item.values.iter().enumerate() {
            sums[index] += value;
        }
    }
    let count = items.len() as f64;
    Some(largest_remainder_round(sums.map(|value| value / count)))
}

/// Rescales the agree pair and the remaining three labels so the topline lands on `target`.
pub fn rescale_topline(distribution: &Distribution, target: f64) -> Distribution {
    let target = target.clamp(0.0, 100.0);
    let [sa, a, n, sd, sdd] = distribution.values;

    let agree = sa + a;
    let (new_sa, new_a) = if agree > 0.0 {
        (sa * target / agree, a * target / agree)
    } else {
        (target / 2.0, target / 2.0)
    };

    let remaining = 100.0 - target;
    let other = n + sd + sdd;
    let (new_n, new_sd, new_sdd) = if other > 0.0 {
        let scale = remaining / other;
        (n * scale, sd * scale, sdd * scale)
    } else {
        (remaining / 3.0, remaining / 3.0, remaining / 3.0)
    };

    largest_remainder_round([new_sa, new_a, new_n, new_sd, new_sdd])
}

fn clip_non_negative(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
