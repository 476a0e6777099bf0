/// Exit status the `timeout` wrapper reports when it had to kill its child.
pub const TIMEOUT_RETURN_VALUE: i32 = 124;

/// 128 + SIGABRT, as reported by a shell or by `timeout` for an aborted child.
pub const SIGABORT_RETURN_VALUE: i32 = 134;

/// Outcome of a single subprocess run.
///
/// Built once per `Device::execute_command` call and never modified
/// afterwards. When output was captured, the last stdout line is always the
/// synthetic `RETURN CODE: <n>` trailer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    return_value: i32,
    output: Vec<String>,
    error: Vec<String>,
}

impl ExecutionResult {
    /// A result for a run whose streams were not captured.
    pub fn uncaptured(return_value: i32) -> Self {
        Self {
            return_value,
            output: Vec::new(),
            error: Vec::new(),
        }
    }

    /// A result for a run whose streams were captured. Appends the
    /// `RETURN CODE` trailer to `output`.
    pub fn captured(return_value: i32, mut output: Vec<String>, error: Vec<String>) -> Self {
        output.push(format!("RETURN CODE: {return_value}"));
        Self {
            return_value,
            output,
            error,
        }
    }

    pub fn return_value(&self) -> i32 {
        self.return_value
    }

    pub fn output(&self) -> &[String] {
        &self.output
    }

    pub fn error(&self) -> &[String] {
        &self.error
    }

    pub fn is_timeout(&self) -> bool {
        self.return_value == TIMEOUT_RETURN_VALUE
    }

    pub fn is_sigabort(&self) -> bool {
        self.return_value == SIGABORT_RETURN_VALUE
    }

    pub fn flattened_output(&self) -> String {
        self.output.concat()
    }

    pub fn flattened_output_with_newlines(&self) -> String {
        join_lines(&self.output)
    }

    pub fn flattened_error(&self) -> String {
        self.error.concat()
    }

    pub fn flattened_error_with_newlines(&self) -> String {
        join_lines(&self.error)
    }

    /// Stdout followed by stderr, for substring searches over everything the
    /// process printed.
    pub fn flattened_all(&self) -> String {
        let mut all = self.flattened_output();
        all.push_str(&self.flattened_error());
        all
    }
}

fn join_lines(lines: &[String]) -> String {
    let mut joined = String::new();
    for line in lines {
        joined.push_str(line);
        joined.push('\n');
    }
    joined
}
