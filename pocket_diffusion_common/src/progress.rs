use indicatif::{ProgressBar, ProgressBarIter, ProgressStyle};

/// Wrap an iterator in a terminal progress bar. `COLOR` is one of `b`, `g` or `r`; the bar is hidden when the
/// third field is `true`.
pub struct NiceProgressBar<T: ExactSizeIterator, const COLOR: char = 'b'>(
    pub T,
    pub &'static str,
    pub bool,
);

impl<T: ExactSizeIterator, const COLOR: char> IntoIterator for NiceProgressBar<T, COLOR> {
    type IntoIter = ProgressBarIter<T>;
    type Item = T::Item;

    fn into_iter(self) -> Self::IntoIter {
        let NiceProgressBar(iter, label, silent) = self;
        if silent {
            return ProgressBar::hidden().wrap_iter(iter);
        }
        let color = match COLOR {
            'g' => "green",
            'r' => "red",
            _ => "blue",
        };
        let bar = ProgressBar::new(iter.len() as u64);
        let style = ProgressStyle::with_template(&format!(
            "{label}: [{{elapsed_precise}}] [{{bar:40.{color}/{color}}}] {{pos}}/{{len}} ({{eta}})"
        ))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
        bar.set_style(style);
        bar.wrap_iter(iter)
    }
}
