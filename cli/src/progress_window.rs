use indicatif::{ProgressBar, ProgressStyle};
use neural_style::{ProgressUpdate, TransferProgress};

pub struct ProgressWindow {
    pb: ProgressBar,
    budget: usize,
}

impl ProgressWindow {
    pub fn new(budget: usize) -> Self {
        let sty = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .progress_chars("##-");

        let pb = ProgressBar::new(budget as u64);
        pb.set_style(sty);

        Self { pb, budget }
    }
}

impl Drop for ProgressWindow {
    fn drop(&mut self) {
        self.pb.finish();
    }
}

impl TransferProgress for ProgressWindow {
    fn update(&mut self, update: ProgressUpdate) {
        if update.budget != self.budget {
            self.budget = update.budget;
            self.pb.set_length(self.budget as u64);
        }

        // The last step can run past the budget
        self.pb.set_position(update.iteration.min(self.budget) as u64);
        self.pb.set_message(&format!(
            "style {:.4} content {:.4}",
            update.style_score, update.content_score
        ));
    }
}
