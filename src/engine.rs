//! Exercise session engine.
//!
//! Drives one student through a fixed sequence of sentences, collecting one
//! case judgment per annotated word. The run is held in memory by the server
//! and committed to the database exactly once, when the last sentence is
//! advanced past. Nothing in here touches the database: the handlers feed the
//! engine its sentences at start and receive a [`SubmissionDraft`] back at the
//! end.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExerciseKind {
    Practice,
    Test,
    Challenge,
}

impl ExerciseKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "practice" => Some(ExerciseKind::Practice),
            "test" => Some(ExerciseKind::Test),
            "challenge" => Some(ExerciseKind::Challenge),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExerciseKind::Practice => "practice",
            ExerciseKind::Test => "test",
            ExerciseKind::Challenge => "challenge",
        }
    }
}

/// Lifecycle of a run. `AwaitingStart` only occurs for test exercises, which
/// must not begin until the client confirms the fullscreen lock is in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    AwaitingStart,
    Answering,
    Feedback,
    Completed,
    Abandoned,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("the exercise has not been started yet")]
    NotStarted,

    #[error("the exercise is already finished")]
    Finished,

    #[error("answering is blocked until fullscreen is restored")]
    FocusLost,

    #[error("no word is currently selected")]
    NoSelection,

    #[error("the current sentence still has unanswered words")]
    Incomplete,

    #[error("the current sentence has already been checked")]
    AlreadyChecked,

    #[error("the current sentence has not been checked yet")]
    NotChecked,

    #[error("exit codes only apply to test exercises")]
    NotATest,

    #[error("the supplied exit code does not match")]
    ExitCodeMismatch,
}

/// Ground-truth label for one token of a sentence, copied from the content
/// store when the run is created.
#[derive(Debug, Clone)]
pub struct Annotation {
    pub case_id: i64,
    pub explanation: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SentenceItem {
    pub id: i64,
    pub text: String,
    /// Keyed by 0-based token index. Tokens without an entry are not part of
    /// the exercise.
    pub annotations: BTreeMap<usize, Annotation>,
}

/// A student's tentative judgment for one word. Overwritten in place if the
/// student re-selects a different case before moving on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub sentence_id: i64,
    pub word_index: usize,
    pub selected_case_id: i64,
    pub correct_case_id: i64,
    pub is_correct: bool,
}

/// One row-to-be of `exercise_attempts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptDraft {
    pub sentence_id: i64,
    pub word_index: i32,
    pub selected_case_id: Option<i64>,
    pub correct_case_id: i64,
    pub is_correct: bool,
    pub time_spent_seconds: i32,
}

/// Everything the submission transaction needs, in one value. Produced by
/// [`ExerciseRun::advance`] on the last sentence; the run itself stays in
/// `Feedback` so a failed write can be retried with a fresh draft.
#[derive(Debug, Clone)]
pub struct SubmissionDraft {
    pub attempts: Vec<AttemptDraft>,
    pub attempt_count: i32,
    pub correct_count: i32,
}

#[derive(Debug)]
pub enum Advance {
    /// Moved on to the sentence at this index.
    Next(usize),
    /// The last sentence was advanced past; commit this draft.
    Submit(SubmissionDraft),
}

/// Per-word result revealed when a sentence is checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordReveal {
    pub word_index: usize,
    pub selected_case_id: i64,
    pub correct_case_id: i64,
    pub is_correct: bool,
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerOutcome {
    pub word_index: usize,
    pub answered_count: usize,
    pub required_count: usize,
}

#[derive(Debug)]
pub struct ExerciseRun {
    session_id: i64,
    student_id: i64,
    kind: ExerciseKind,
    exit_code: Option<String>,
    sentences: Vec<SentenceItem>,
    current: usize,
    phase: Phase,
    focus_lost: bool,
    pending: Option<usize>,
    answers: BTreeMap<(i64, usize), Answer>,
    created_at: DateTime<Utc>,
}

impl ExerciseRun {
    pub fn new(
        session_id: i64,
        student_id: i64,
        kind: ExerciseKind,
        exit_code: Option<String>,
        sentences: Vec<SentenceItem>,
    ) -> Self {
        let phase = if kind == ExerciseKind::Test {
            Phase::AwaitingStart
        } else {
            Phase::Answering
        };
        ExerciseRun {
            session_id,
            student_id,
            kind,
            exit_code,
            sentences,
            current: 0,
            phase,
            focus_lost: false,
            pending: None,
            answers: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    pub fn student_id(&self) -> i64 {
        self.student_id
    }

    pub fn kind(&self) -> ExerciseKind {
        self.kind
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn focus_lost(&self) -> bool {
        self.focus_lost
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn sentence_count(&self) -> usize {
        self.sentences.len()
    }

    pub fn answer_count(&self) -> usize {
        self.answers.len()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Leaves `AwaitingStart`. No-op for runs that never waited.
    pub fn begin(&mut self) {
        if self.phase == Phase::AwaitingStart {
            self.phase = Phase::Answering;
        }
    }

    fn ensure_active(&self) -> Result<(), EngineError> {
        match self.phase {
            Phase::AwaitingStart => return Err(EngineError::NotStarted),
            Phase::Completed | Phase::Abandoned => return Err(EngineError::Finished),
            Phase::Answering | Phase::Feedback => {}
        }
        if self.focus_lost {
            return Err(EngineError::FocusLost);
        }
        Ok(())
    }

    fn current_sentence(&self) -> &SentenceItem {
        &self.sentences[self.current]
    }

    fn answered_count(&self) -> usize {
        let sentence = self.current_sentence();
        sentence
            .annotations
            .keys()
            .filter(|idx| self.answers.contains_key(&(sentence.id, **idx)))
            .count()
    }

    /// Marks a word of the current sentence as the pending selection. Returns
    /// `false` (and changes nothing) for indices without an annotation.
    pub fn select_word(&mut self, word_index: usize) -> Result<bool, EngineError> {
        self.ensure_active()?;
        if self.phase == Phase::Feedback {
            return Err(EngineError::AlreadyChecked);
        }
        if !self.current_sentence().annotations.contains_key(&word_index) {
            return Ok(false);
        }
        self.pending = Some(word_index);
        Ok(true)
    }

    /// Records the case judgment for the pending selection. Re-answering the
    /// same word replaces the previous answer; the last choice wins.
    pub fn choose_case(&mut self, case_id: i64) -> Result<AnswerOutcome, EngineError> {
        self.ensure_active()?;
        if self.phase == Phase::Feedback {
            return Err(EngineError::AlreadyChecked);
        }
        let word_index = self.pending.ok_or(EngineError::NoSelection)?;
        let sentence_id = self.current_sentence().id;
        let annotation = self
            .current_sentence()
            .annotations
            .get(&word_index)
            .ok_or(EngineError::NoSelection)?;

        let answer = Answer {
            sentence_id,
            word_index,
            selected_case_id: case_id,
            correct_case_id: annotation.case_id,
            is_correct: annotation.case_id == case_id,
        };
        self.answers.insert((sentence_id, word_index), answer);
        self.pending = None;

        Ok(AnswerOutcome {
            word_index,
            answered_count: self.answered_count(),
            required_count: self.current_sentence().annotations.len(),
        })
    }

    /// Reveals the results for the current sentence. Rejected while any
    /// annotated word is unanswered; a sentence without annotations is
    /// vacuously complete.
    pub fn check_answer(&mut self) -> Result<Vec<WordReveal>, EngineError> {
        self.ensure_active()?;
        if self.phase == Phase::Feedback {
            return Err(EngineError::AlreadyChecked);
        }
        if self.answered_count() < self.current_sentence().annotations.len() {
            return Err(EngineError::Incomplete);
        }

        self.phase = Phase::Feedback;
        self.pending = None;

        let sentence = self.current_sentence();
        let reveals = sentence
            .annotations
            .iter()
            .map(|(word_index, annotation)| {
                let answer = &self.answers[&(sentence.id, *word_index)];
                WordReveal {
                    word_index: *word_index,
                    selected_case_id: answer.selected_case_id,
                    correct_case_id: answer.correct_case_id,
                    is_correct: answer.is_correct,
                    explanation: annotation.explanation.clone(),
                }
            })
            .collect();
        Ok(reveals)
    }

    /// Moves past the current sentence. On the last sentence this yields the
    /// submission draft instead; the phase stays `Feedback` until
    /// [`ExerciseRun::mark_completed`] confirms the write went through, so a
    /// failed submission can simply be advanced again.
    pub fn advance(&mut self, elapsed_seconds: i64) -> Result<Advance, EngineError> {
        self.ensure_active()?;
        if self.phase != Phase::Feedback {
            return Err(EngineError::NotChecked);
        }

        if self.current + 1 < self.sentences.len() {
            self.current += 1;
            self.phase = Phase::Answering;
            self.pending = None;
            return Ok(Advance::Next(self.current));
        }

        Ok(Advance::Submit(self.build_draft(elapsed_seconds)))
    }

    pub fn mark_completed(&mut self) {
        self.phase = Phase::Completed;
    }

    /// The elapsed time is apportioned evenly across all answers (integer
    /// floor); per-question timing is not tracked.
    fn build_draft(&self, elapsed_seconds: i64) -> SubmissionDraft {
        let count = self.answers.len();
        let per_attempt = if count > 0 {
            (elapsed_seconds.max(0) / count as i64) as i32
        } else {
            0
        };

        let attempts: Vec<AttemptDraft> = self
            .answers
            .values()
            .map(|answer| AttemptDraft {
                sentence_id: answer.sentence_id,
                word_index: answer.word_index as i32,
                selected_case_id: Some(answer.selected_case_id),
                correct_case_id: answer.correct_case_id,
                is_correct: answer.is_correct,
                time_spent_seconds: per_attempt,
            })
            .collect();

        let correct_count = attempts.iter().filter(|a| a.is_correct).count() as i32;
        SubmissionDraft {
            attempt_count: attempts.len() as i32,
            correct_count,
            attempts,
        }
    }

    /// Test mode only: flags that the browser left fullscreen. All answering
    /// operations are rejected until [`ExerciseRun::resume_focus`].
    pub fn report_focus_lost(&mut self) {
        if self.kind == ExerciseKind::Test
            && matches!(self.phase, Phase::Answering | Phase::Feedback)
        {
            self.focus_lost = true;
        }
    }

    pub fn resume_focus(&mut self) {
        self.focus_lost = false;
    }

    /// Validates the code-gated abort of a test exercise without changing
    /// anything. Abandoning is a separate step ([`ExerciseRun::mark_abandoned`])
    /// so the durable status update can happen in between; if that update
    /// fails the run is still playable and the exit can be retried.
    pub fn verify_exit_code(&self, code: &str) -> Result<(), EngineError> {
        if self.kind != ExerciseKind::Test {
            return Err(EngineError::NotATest);
        }
        if matches!(self.phase, Phase::Completed | Phase::Abandoned) {
            return Err(EngineError::Finished);
        }
        match &self.exit_code {
            Some(expected) if expected == code => Ok(()),
            _ => Err(EngineError::ExitCodeMismatch),
        }
    }

    /// Abandons the run and discards every collected answer.
    pub fn mark_abandoned(&mut self) {
        self.phase = Phase::Abandoned;
        self.answers.clear();
        self.pending = None;
    }
}
