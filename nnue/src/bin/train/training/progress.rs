use indicatif::{ProgressBar, ProgressStyle};

pub struct TrainingProgressBar {
    bar: ProgressBar,
}

impl TrainingProgressBar {
    pub fn new(num_batches: usize, superbatch: usize, end: usize) -> Result<Self, Box<dyn std::error::Error>> {
        let bar = ProgressBar::new(num_batches as u64);
        bar.set_style(ProgressStyle::default_bar().template(
            "{spinner:.cyan} {prefix} {pos}/{len} [{wide_bar:.cyan/blue}] {eta_precise} | {msg}",
        )?);
        bar.set_prefix(format!("sb {}/{}", superbatch, end));
        Ok(Self { bar })
    }

    pub fn update(&self, value_loss: f32, policy_loss: f32, positions_per_sec: f64) {
        self.bar.set_message(format!(
            "value: {:.5}, policy: {:.5}, {:.0} pos/s",
            value_loss, policy_loss, positions_per_sec
        ));
        self.bar.inc(1);
    }

    pub fn finish(&self) {
        self.bar.finish();
    }
}
