//! 交互端口
//!
//! 业务逻辑只在明确的决策点（恢复方式选择、元数据升级中的 Router 处理）
//! 通过 [`InteractionPort`] 询问操作者；CLI 与自动化调用共享同一套核心。

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, BufRead, Write};

use crate::{Result, TopologyError};

pub trait InteractionPort: Send + Sync {
    fn is_interactive(&self) -> bool;

    /// 是/否确认
    fn confirm(&self, question: &str, default: bool) -> Result<bool>;

    /// 从候选项中选择一个，返回下标
    fn select(&self, question: &str, options: &[String], default: usize) -> Result<usize>;

    fn password(&self, prompt: &str) -> Result<String>;
}

/// 非交互模式：所有需要人工判断的地方直接失败
#[derive(Debug, Default, Clone, Copy)]
pub struct NonInteractive;

impl InteractionPort for NonInteractive {
    fn is_interactive(&self) -> bool {
        false
    }

    fn confirm(&self, _question: &str, default: bool) -> Result<bool> {
        Ok(default)
    }

    fn select(&self, question: &str, _options: &[String], _default: usize) -> Result<usize> {
        Err(TopologyError::ArgumentError(format!(
            "Operation requires an interactive decision: {}",
            question.lines().next().unwrap_or(question)
        )))
    }

    fn password(&self, prompt: &str) -> Result<String> {
        Err(TopologyError::ArgumentError(format!(
            "Password required but the session is not interactive: {}",
            prompt
        )))
    }
}

/// 预先写好的回答
#[derive(Debug, Clone)]
pub enum ScriptedAnswer {
    Confirm(bool),
    Select(usize),
    /// 按选项文本前缀选择
    Choose(String),
    Text(String),
}

/// 按顺序回放预设回答，并记录所有被问到的问题
#[derive(Debug, Default)]
pub struct ScriptedInteraction {
    answers: Mutex<VecDeque<ScriptedAnswer>>,
    asked: Mutex<Vec<String>>,
}

impl ScriptedInteraction {
    pub fn new(answers: Vec<ScriptedAnswer>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            asked: Mutex::new(Vec::new()),
        }
    }

    /// 已经问过的问题
    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().clone()
    }

    pub fn remaining(&self) -> usize {
        self.answers.lock().len()
    }

    fn next(&self, question: &str) -> Result<ScriptedAnswer> {
        self.asked.lock().push(question.to_string());
        self.answers.lock().pop_front().ok_or_else(|| {
            TopologyError::Cancelled(format!("No scripted answer for: {}", question))
        })
    }
}

impl InteractionPort for ScriptedInteraction {
    fn is_interactive(&self) -> bool {
        true
    }

    fn confirm(&self, question: &str, _default: bool) -> Result<bool> {
        match self.next(question)? {
            ScriptedAnswer::Confirm(answer) => Ok(answer),
            other => Err(TopologyError::InternalError(format!(
                "Scripted answer {:?} does not fit a yes/no question",
                other
            ))),
        }
    }

    fn select(&self, question: &str, options: &[String], _default: usize) -> Result<usize> {
        let index = match self.next(question)? {
            ScriptedAnswer::Select(index) => index,
            ScriptedAnswer::Choose(text) => options
                .iter()
                .position(|o| o.starts_with(&text))
                .ok_or_else(|| {
                    TopologyError::ArgumentError(format!("No option starting with '{}'", text))
                })?,
            other => {
                return Err(TopologyError::InternalError(format!(
                    "Scripted answer {:?} does not fit a choice",
                    other
                )))
            }
        };
        if index >= options.len() {
            return Err(TopologyError::ArgumentError(format!(
                "Option {} out of range ({} options)",
                index,
                options.len()
            )));
        }
        Ok(index)
    }

    fn password(&self, prompt: &str) -> Result<String> {
        match self.next(prompt)? {
            ScriptedAnswer::Text(text) => Ok(text),
            other => Err(TopologyError::InternalError(format!(
                "Scripted answer {:?} does not fit a password prompt",
                other
            ))),
        }
    }
}

/// 终端交互
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleInteraction;

impl ConsoleInteraction {
    fn read_line(&self, prompt: &str) -> Result<String> {
        let mut stdout = io::stdout();
        write!(stdout, "{} ", prompt)?;
        stdout.flush()?;
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        Ok(line.trim().to_string())
    }
}

impl InteractionPort for ConsoleInteraction {
    fn is_interactive(&self) -> bool {
        true
    }

    fn confirm(&self, question: &str, default: bool) -> Result<bool> {
        let hint = if default { "[Y/n]" } else { "[y/N]" };
        let answer = self.read_line(&format!("{} {}:", question, hint))?;
        Ok(match answer.to_ascii_lowercase().as_str() {
            "" => default,
            "y" | "yes" => true,
            _ => false,
        })
    }

    fn select(&self, question: &str, options: &[String], default: usize) -> Result<usize> {
        println!("{}", question);
        for (i, option) in options.iter().enumerate() {
            println!("  {}) {}", i + 1, option);
        }
        loop {
            let answer = self.read_line(&format!("Please select an option [{}]:", default + 1))?;
            if answer.is_empty() {
                return Ok(default);
            }
            match answer.parse::<usize>() {
                Ok(n) if n >= 1 && n <= options.len() => return Ok(n - 1),
                _ => println!("Invalid option '{}'", answer),
            }
        }
    }

    fn password(&self, prompt: &str) -> Result<String> {
        self.read_line(prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_answers_in_order() {
        let port = ScriptedInteraction::new(vec![
            ScriptedAnswer::Confirm(true),
            ScriptedAnswer::Choose("Unregister".to_string()),
        ]);
        assert!(port.confirm("continue?", false).unwrap());
        let options = vec!["Re-check".to_string(), "Unregister the remaining Routers.".to_string()];
        assert_eq!(port.select("what now?", &options, 0).unwrap(), 1);
        assert_eq!(port.asked(), vec!["continue?".to_string(), "what now?".to_string()]);

        // 回答用尽后视为取消
        assert!(matches!(port.confirm("again?", false), Err(TopologyError::Cancelled(_))));
    }

    #[test]
    fn test_non_interactive_refuses_choices() {
        assert!(!NonInteractive.is_interactive());
        assert!(NonInteractive.select("pick", &["a".to_string()], 0).is_err());
        assert!(NonInteractive.confirm("ok?", true).unwrap());
    }
}
