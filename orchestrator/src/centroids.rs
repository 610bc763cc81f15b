use log::debug;
use machine_learning::MlErr;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

use crate::Result;

/// One centroid embedding per speaker class.
///
/// Class ids are the dense range `[0, n_speaker)`, so the centroids live in a
/// `[n_speaker, dim]` matrix and a mask tells which rows hold a centroid. Iteration
/// always follows class id order.
#[derive(Debug, Clone, PartialEq)]
pub struct CentroidTable {
    centroids: Array2<f32>,
    initialized: Vec<bool>,
}

impl CentroidTable {
    /// Creates an empty table for `n_speaker` classes of `dim`-dimensional embeddings.
    pub fn new(n_speaker: usize, dim: usize) -> Self {
        Self {
            centroids: Array2::zeros((n_speaker, dim)),
            initialized: vec![false; n_speaker],
        }
    }

    /// Builds the enrollment table: every class gets the true mean of its embeddings.
    ///
    /// Classes without any embedding are left out of the table.
    ///
    /// # Arguments
    /// * `n_speaker` - The amount of classes.
    /// * `embeddings` - A `[n, dim]` matrix.
    /// * `labels` - The class of each row of `embeddings`.
    pub fn from_enrollment(
        n_speaker: usize,
        embeddings: ArrayView2<f32>,
        labels: &[usize],
    ) -> Result<Self> {
        let mut table = Self::new(n_speaker, embeddings.ncols());
        let (sums, counts) = table.class_sums(embeddings, labels)?;

        for (class, &count) in counts.iter().enumerate() {
            if count > 0 {
                let mean = &sums.row(class) / count as f32;
                table.centroids.row_mut(class).assign(&mean);
                table.initialized[class] = true;
            }
        }

        Ok(table)
    }

    /// The amount of classes the table has room for.
    pub fn n_speaker(&self) -> usize {
        self.initialized.len()
    }

    pub fn dim(&self) -> usize {
        self.centroids.ncols()
    }

    pub fn is_initialized(&self, class: usize) -> bool {
        self.initialized.get(class).copied().unwrap_or(false)
    }

    /// The centroid of `class`, if it has one.
    pub fn get(&self, class: usize) -> Option<ArrayView1<'_, f32>> {
        self.is_initialized(class)
            .then(|| self.centroids.row(class))
    }

    /// Copies the centroid of `class` out of the table.
    pub fn to_vec(&self, class: usize) -> Option<Vec<f32>> {
        self.get(class).map(|c| c.to_vec())
    }

    /// Iterates the initialized centroids in class id order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, ArrayView1<'_, f32>)> {
        self.centroids
            .outer_iter()
            .enumerate()
            .filter(|(class, _)| self.initialized[*class])
    }

    /// Folds one epoch of embeddings into the table.
    ///
    /// For every class seen this epoch the new mean is blended with the previous
    /// centroid as `(old + new) / 2`, or taken as is when there's no previous centroid.
    /// A class never seen so far gets the zero vector.
    ///
    /// # Arguments
    /// * `embeddings` - Every embedding produced during the epoch, `[n, dim]`.
    /// * `labels` - The class of each row of `embeddings`.
    pub fn blend_epoch(&mut self, embeddings: ArrayView2<f32>, labels: &[usize]) -> Result<()> {
        let (sums, counts) = self.class_sums(embeddings, labels)?;

        for (class, &count) in counts.iter().enumerate() {
            let mut centroid = self.centroids.row_mut(class);

            if count == 0 {
                if !self.initialized[class] {
                    centroid.fill(0.);
                    self.initialized[class] = true;
                }
                continue;
            }

            let mean = &sums.row(class) / count as f32;
            if self.initialized[class] {
                centroid.zip_mut_with(&mean, |old, &new| *old = (*old + new) / 2.);
            } else {
                centroid.assign(&mean);
                self.initialized[class] = true;
            }
        }

        debug!(classes = self.n_speaker(), examples = labels.len(); "blended epoch centroids");
        Ok(())
    }

    /// Sums the embeddings of each class and counts them.
    fn class_sums(
        &self,
        embeddings: ArrayView2<f32>,
        labels: &[usize],
    ) -> Result<(Array2<f32>, Vec<usize>)> {
        if embeddings.nrows() != labels.len() {
            return Err(MlErr::SizeMismatch {
                what: "centroid labels",
                got: labels.len(),
                expected: embeddings.nrows(),
            }
            .into());
        }

        if !labels.is_empty() && embeddings.ncols() != self.dim() {
            return Err(MlErr::SizeMismatch {
                what: "embedding dimension",
                got: embeddings.ncols(),
                expected: self.dim(),
            }
            .into());
        }

        let n_speaker = self.n_speaker();
        let mut sums = Array2::zeros((n_speaker, self.dim()));
        let mut counts = vec![0; n_speaker];

        for (row, &label) in embeddings.axis_iter(Axis(0)).zip(labels) {
            if label >= n_speaker {
                return Err(MlErr::LabelOutOfRange {
                    label,
                    classes: n_speaker,
                }
                .into());
            }

            let mut sum = sums.row_mut(label);
            sum += &row;
            counts[label] += 1;
        }

        Ok((sums, counts))
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn first_epoch_takes_the_mean() {
        let mut table = CentroidTable::new(2, 2);
        let embeddings = array![[1., 0.], [3., 2.], [0., 4.]];
        table.blend_epoch(embeddings.view(), &[0, 0, 1]).unwrap();

        assert_eq!(table.to_vec(0).unwrap(), [2., 1.]);
        assert_eq!(table.to_vec(1).unwrap(), [0., 4.]);
    }

    #[test]
    fn later_epochs_halve_towards_the_new_mean() {
        let mut table = CentroidTable::new(1, 2);
        table.blend_epoch(array![[4., 0.]].view(), &[0]).unwrap();
        table.blend_epoch(array![[0., 4.]].view(), &[0]).unwrap();
        assert_eq!(table.to_vec(0).unwrap(), [2., 2.]);

        table.blend_epoch(array![[0., 4.]].view(), &[0]).unwrap();
        assert_eq!(table.to_vec(0).unwrap(), [1., 3.]);
    }

    #[test]
    fn identical_epochs_are_a_fixed_point() {
        let mut table = CentroidTable::new(1, 3);
        let embeddings = array![[0.3, -1.2, 7.5], [0.3, -1.2, 7.5]];

        table.blend_epoch(embeddings.view(), &[0, 0]).unwrap();
        table.blend_epoch(embeddings.view(), &[0, 0]).unwrap();
        assert_eq!(table.to_vec(0).unwrap(), [0.3, -1.2, 7.5]);
    }

    #[test]
    fn unseen_class_falls_back_to_zero() {
        let mut table = CentroidTable::new(3, 2);
        table.blend_epoch(array![[1., 1.]].view(), &[0]).unwrap();

        assert!(table.is_initialized(2));
        assert_eq!(table.to_vec(2).unwrap(), [0., 0.]);
        assert_eq!(table.iter().count(), 3);
    }

    #[test]
    fn unseen_class_keeps_its_previous_centroid() {
        let mut table = CentroidTable::new(2, 1);
        table.blend_epoch(array![[1.], [5.]].view(), &[0, 1]).unwrap();
        table.blend_epoch(array![[3.]].view(), &[0]).unwrap();

        assert_eq!(table.to_vec(0).unwrap(), [2.]);
        assert_eq!(table.to_vec(1).unwrap(), [5.]);
    }

    #[test]
    fn enrollment_uses_the_true_mean_and_skips_empty_classes() {
        let embeddings = array![[1., 0.], [0.9, 0.], [1.1, 0.], [0., 2.]];
        let table = CentroidTable::from_enrollment(3, embeddings.view(), &[0, 0, 0, 1]).unwrap();

        let c0 = table.to_vec(0).unwrap();
        assert!((c0[0] - 1.).abs() < 1e-6);
        assert_eq!(table.to_vec(1).unwrap(), [0., 2.]);
        assert!(table.get(2).is_none());

        let classes: Vec<usize> = table.iter().map(|(class, _)| class).collect();
        assert_eq!(classes, [0, 1]);
    }

    #[test]
    fn out_of_range_labels_are_rejected() {
        let mut table = CentroidTable::new(2, 1);
        assert!(table.blend_epoch(array![[1.]].view(), &[2]).is_err());
        assert!(table.blend_epoch(array![[1.]].view(), &[0, 1]).is_err());
    }
}
