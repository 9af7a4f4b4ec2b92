use std::time::Instant;

#[derive(Clone, Debug, PartialEq)]
pub struct Progress {
    pub label: &'static str,
    /// Completed fraction of the current phase, in `[0, 1]`.
    pub fraction: f32,
}

impl Progress {
    pub(crate) fn new(label: &'static str, done: usize, total: usize) -> Self {
        let fraction = if total == 0 {
            1.
        } else {
            (done as f32 / total as f32).min(1.)
        };
        Self { label, fraction }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum JobStatus {
    Pending(Progress),
    Done,
}

/// A long computation split into whole units of work.
///
/// Each call to [`Job::step`] performs at most `budget` units (one vertex,
/// particle, cluster...) and never stops inside one, so a job can be resumed
/// later or dropped at any step boundary.
pub trait Job {
    type Output;

    fn step(&mut self, budget: usize) -> JobStatus;

    /// Takes the result after `step` returned [`JobStatus::Done`].
    fn take_output(&mut self) -> Option<Self::Output>;
}

impl<J: Job + ?Sized> Job for Box<J> {
    type Output = J::Output;

    fn step(&mut self, budget: usize) -> JobStatus {
        (**self).step(budget)
    }

    fn take_output(&mut self) -> Option<Self::Output> {
        (**self).take_output()
    }
}

/// Runs `job` without yielding.
pub fn run_to_completion<J: Job + ?Sized>(job: &mut J) -> Option<J::Output> {
    while let JobStatus::Pending(_) = job.step(usize::MAX) {}
    job.take_output()
}

/// Steps `job` with `budget` units per step until it finishes or `deadline`
/// passes, reporting progress after every step.
pub fn run_until<J: Job + ?Sized>(
    job: &mut J,
    budget: usize,
    deadline: Instant,
    mut on_progress: impl FnMut(&Progress),
) -> Option<J::Output> {
    loop {
        match job.step(budget.max(1)) {
            JobStatus::Done => return job.take_output(),
            JobStatus::Pending(progress) => {
                on_progress(&progress);
                if Instant::now() >= deadline {
                    return None;
                }
            }
        }
    }
}
