//! Pairing of segmentation files with the image series they were drawn on.

use std::collections::VecDeque;
use std::io::{BufRead, Write};

use thiserror::Error;

use crate::series::ImageSeries;

/// Rejected reply to the series question.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("IndexError : list index out of range. Please enter a valid index. Try again.")]
    Index { index: i64 },

    #[error(
        "ValueError : invalid literal for int() with base 10: '{input}'. Please enter an index (integer), not a name. Try again."
    )]
    Value { input: String },
}

/// Rejected reply to the additional-series question.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Try again. Make sure to choose between 'y' or 'n'.")]
pub struct ContinuationError {
    pub input: String,
}

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("Input closed before an answer was given")]
    InputClosed,

    #[error("Scripted selections exhausted")]
    Exhausted,

    #[error("Scripted index {index} is out of range for {available} series")]
    OutOfRange { index: usize, available: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Source of association decisions.
pub trait SelectionProvider {
    /// Index into `series` of the source of `segmentation_name`.
    fn select_series(
        &mut self,
        segmentation_name: &str,
        series: &[ImageSeries],
    ) -> Result<usize, PromptError>;

    /// Whether another series should be associated with the segmentation
    /// that was just written.
    fn add_another_series(&mut self) -> Result<bool, PromptError>;
}

/// Parse a reply to the series question. Negative indices count from the
/// end of the list.
pub fn parse_series_index(input: &str, available: usize) -> Result<usize, SelectionError> {
    let trimmed = input.trim();
    let index: i64 = trimmed.parse().map_err(|_| SelectionError::Value {
        input: trimmed.to_string(),
    })?;
    let resolved = if index < 0 {
        available as i64 + index
    } else {
        index
    };
    if (0..available as i64).contains(&resolved) {
        Ok(resolved as usize)
    } else {
        Err(SelectionError::Index { index })
    }
}

/// Only a literal `y` or `n` is accepted.
pub fn parse_continuation(input: &str) -> Result<bool, ContinuationError> {
    match input.trim_end_matches(['\r', '\n']) {
        "y" => Ok(true),
        "n" => Ok(false),
        other => Err(ContinuationError {
            input: other.to_string(),
        }),
    }
}

/// Terminal dialogue. Questions go to `output`, replies are read line by
/// line from `input`; invalid replies are reported and asked again.
pub struct ConsolePrompt<R, W> {
    input: R,
    output: W,
}

impl ConsolePrompt<std::io::StdinLock<'static>, std::io::Stdout> {
    pub fn stdio() -> Self {
        Self::new(std::io::stdin().lock(), std::io::stdout())
    }
}

impl<R: BufRead, W: Write> ConsolePrompt<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    pub fn into_output(self) -> W {
        self.output
    }

    fn read_line(&mut self) -> Result<String, PromptError> {
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Err(PromptError::InputClosed);
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    fn display_series_list(&mut self, series: &[ImageSeries]) -> Result<(), PromptError> {
        let patient_id = series
            .first()
            .map(|series| series.patient_id.as_str())
            .unwrap_or_default();
        writeln!(self.output, "{}\nPatient ID : {patient_id}", "-".repeat(50))?;
        for (index, series) in series.iter().enumerate() {
            writeln!(
                self.output,
                "Series index: {index}, Series Description: {}",
                series.series_description
            )?;
        }
        Ok(())
    }
}

impl<R: BufRead, W: Write> SelectionProvider for ConsolePrompt<R, W> {
    fn select_series(
        &mut self,
        segmentation_name: &str,
        series: &[ImageSeries],
    ) -> Result<usize, PromptError> {
        self.display_series_list(series)?;
        loop {
            write!(
                self.output,
                "Which of the above series contains the source images for the segmentation named \
                 {segmentation_name}? \nPlease enter the reference series index here:"
            )?;
            self.output.flush()?;
            let reply = self.read_line()?;
            match parse_series_index(&reply, series.len()) {
                Ok(index) => return Ok(index),
                Err(err) => writeln!(self.output, "{err}")?,
            }
        }
    }

    fn add_another_series(&mut self) -> Result<bool, PromptError> {
        loop {
            write!(
                self.output,
                "Do you want to choose an additional source image for this segmentation? (y/n)"
            )?;
            self.output.flush()?;
            let reply = self.read_line()?;
            match parse_continuation(&reply) {
                Ok(answer) => return Ok(answer),
                Err(err) => writeln!(self.output, "{err}")?,
            }
        }
    }
}

/// Pre-decided answers, consumed in order.
#[derive(Clone, Debug, Default)]
pub struct ScriptedSelections {
    indices: VecDeque<usize>,
    continuations: VecDeque<bool>,
}

impl ScriptedSelections {
    pub fn new(
        indices: impl IntoIterator<Item = usize>,
        continuations: impl IntoIterator<Item = bool>,
    ) -> Self {
        Self {
            indices: indices.into_iter().collect(),
            continuations: continuations.into_iter().collect(),
        }
    }

    /// Answer every question with the same series and never add another.
    pub fn always(index: usize, rounds: usize) -> Self {
        Self::new(std::iter::repeat_n(index, rounds), std::iter::empty())
    }

    pub fn is_exhausted(&self) -> bool {
        self.indices.is_empty() && self.continuations.is_empty()
    }
}

impl SelectionProvider for ScriptedSelections {
    fn select_series(
        &mut self,
        segmentation_name: &str,
        series: &[ImageSeries],
    ) -> Result<usize, PromptError> {
        let index = self.indices.pop_front().ok_or(PromptError::Exhausted)?;
        if index >= series.len() {
            return Err(PromptError::OutOfRange {
                index,
                available: series.len(),
            });
        }
        log::debug!(
            "Associating {segmentation_name} with series {index} ({})",
            series[index].series_description
        );
        Ok(index)
    }

    fn add_another_series(&mut self) -> Result<bool, PromptError> {
        Ok(self.continuations.pop_front().unwrap_or(false))
    }
}

/// Drives a [`SelectionProvider`] over the indexed series of one folder.
pub struct AssociationResolver<'a, P: ?Sized> {
    series: &'a [ImageSeries],
    provider: &'a mut P,
}

impl<'a, P: SelectionProvider + ?Sized> AssociationResolver<'a, P> {
    pub fn new(series: &'a [ImageSeries], provider: &'a mut P) -> Self {
        Self { series, provider }
    }

    /// The series holding the source images of `segmentation_name`.
    pub fn resolve(&mut self, segmentation_name: &str) -> Result<&'a ImageSeries, PromptError> {
        let index = self.provider.select_series(segmentation_name, self.series)?;
        Ok(&self.series[index])
    }

    pub fn add_another(&mut self) -> Result<bool, PromptError> {
        self.provider.add_another_series()
    }
}
