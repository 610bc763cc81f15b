use super::ParamGen;

/// A parameter generator that replays an existing parameter buffer, used to seed a
/// store from a restored checkpoint.
pub struct FixedParamGen {
    params: Vec<f32>,
    cursor: usize,
}

impl FixedParamGen {
    pub fn new(params: Vec<f32>) -> Self {
        Self { params, cursor: 0 }
    }
}

impl ParamGen for FixedParamGen {
    fn sample(&mut self, n: usize) -> Option<Vec<f32>> {
        if self.cursor == self.params.len() {
            return None;
        }

        let end = (self.cursor + n).min(self.params.len());
        let sample = self.params[self.cursor..end].to_vec();
        self.cursor = end;
        Some(sample)
    }
}
