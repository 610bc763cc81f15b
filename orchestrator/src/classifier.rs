use ndarray::ArrayView1;

use crate::centroids::CentroidTable;

/// The score every prediction starts from, below any cosine similarity.
pub const INITIAL_BEST: f32 = -100.;

/// Cosine similarity between `a` and `b`, `0` if either of them has zero norm.
pub fn cosine(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    let norm_a = a.dot(&a).sqrt();
    let norm_b = b.dot(&b).sqrt();

    if norm_a == 0. || norm_b == 0. {
        return 0.;
    }

    (a.dot(&b) / (norm_a * norm_b)).clamp(-1., 1.)
}

/// The outcome of scoring one embedding against a centroid table.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// The best scoring class, `None` only if the table is empty.
    pub class: Option<usize>,
    pub score: f32,
    /// The similarity against every centroid, in table order.
    pub scores: Vec<f32>,
    /// Every class that replaced the running best while scanning the table, in scan order.
    pub leaders: Vec<usize>,
}

impl Prediction {
    /// How many times the running best was replaced while scanning the table.
    pub fn improvements(&self) -> usize {
        self.leaders.len()
    }

    /// Whether `class` held the running best at some point of the scan.
    pub fn led(&self, class: usize) -> bool {
        self.leaders.contains(&class)
    }
}

/// Finds the nearest centroid to `embedding` under cosine similarity.
///
/// Classes are scanned in table order and only a strictly greater similarity replaces
/// the running best, so ties go to the earliest class.
pub fn classify(table: &CentroidTable, embedding: ArrayView1<f32>) -> Prediction {
    let mut prediction = Prediction {
        class: None,
        score: INITIAL_BEST,
        scores: Vec::with_capacity(table.n_speaker()),
        leaders: Vec::new(),
    };

    for (class, centroid) in table.iter() {
        let score = cosine(embedding, centroid);
        prediction.scores.push(score);

        if score > prediction.score {
            prediction.score = score;
            prediction.class = Some(class);
            prediction.leaders.push(class);
        }
    }

    prediction
}
