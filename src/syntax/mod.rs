//! Command tree consumed by the engine
//!
//! Parsing happens elsewhere; any parser that can emit this tree (directly or
//! as JSON through serde) can drive the engine. The small builder helpers at
//! the bottom keep hand-written trees readable.

use serde::{Deserialize, Serialize};

/// A whole script: a compound list run by one sequential executor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub items: Vec<ListItem>,
}

/// One entry of a compound list, optionally terminated by `&`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListItem {
    pub node: Node,
    #[serde(default)]
    pub background: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Command(SimpleCommand),
    Pipeline(Pipeline),
    Logical(Logical),
    If(IfClause),
    For(ForLoop),
    Case(CaseClause),
    Subshell(Vec<ListItem>),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimpleCommand {
    /// Assignment words (`NAME=value`) preceding the command name
    #[serde(default)]
    pub assignments: Vec<Word>,
    /// Absent for assignment-only commands
    #[serde(default)]
    pub name: Option<Word>,
    #[serde(default)]
    pub args: Vec<Word>,
    #[serde(default)]
    pub redirects: Vec<Redirect>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub commands: Vec<SimpleCommand>,
    /// Whether this pipeline is negated with `!` (inverts exit code)
    #[serde(default)]
    pub negated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Logical {
    pub op: LogicalOp,
    pub left: Box<Node>,
    pub right: Box<Node>,
}

/// `elif` chains are nested `If` nodes inside `else_branch`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IfClause {
    pub condition: Vec<ListItem>,
    #[serde(default)]
    pub then_branch: Option<Vec<ListItem>>,
    #[serde(default)]
    pub else_branch: Option<Vec<ListItem>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForLoop {
    pub variable: String,
    pub words: Vec<Word>,
    pub body: Vec<ListItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseClause {
    pub subject: Word,
    pub arms: Vec<CaseArm>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseArm {
    pub patterns: Vec<Word>,
    #[serde(default)]
    pub body: Vec<ListItem>,
}

/// A shell word as a sequence of parts concatenated at evaluation time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Word {
    pub parts: Vec<WordPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WordPart {
    Literal(String),
    /// `$name` / `${name}`
    Param(String),
    /// `$(...)`
    CommandSubst(Vec<ListItem>),
    /// Unquoted glob characters, kept raw for the runtime's glob expansion
    Glob(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RedirectOp {
    #[serde(rename = "<")]
    Input,
    #[serde(rename = ">")]
    Output,
    #[serde(rename = ">>")]
    Append,
    #[serde(rename = ">&")]
    DupOutput,
    #[serde(rename = "<&")]
    DupInput,
}

impl RedirectOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedirectOp::Input => "<",
            RedirectOp::Output => ">",
            RedirectOp::Append => ">>",
            RedirectOp::DupOutput => ">&",
            RedirectOp::DupInput => "<&",
        }
    }

    /// File descriptor the operator applies to when none is written
    pub fn default_fd(&self) -> i32 {
        match self {
            RedirectOp::Input | RedirectOp::DupInput => 0,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Redirect {
    pub op: RedirectOp,
    #[serde(default)]
    pub fd: Option<i32>,
    pub target: Word,
}

impl Script {
    pub fn new(items: Vec<ListItem>) -> Self {
        Self { items }
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

impl ListItem {
    pub fn foreground(node: impl Into<Node>) -> Self {
        Self {
            node: node.into(),
            background: false,
        }
    }

    pub fn background(node: impl Into<Node>) -> Self {
        Self {
            node: node.into(),
            background: true,
        }
    }
}

impl From<SimpleCommand> for Node {
    fn from(cmd: SimpleCommand) -> Self {
        Node::Command(cmd)
    }
}

impl From<Pipeline> for Node {
    fn from(pipeline: Pipeline) -> Self {
        Node::Pipeline(pipeline)
    }
}

impl From<SimpleCommand> for ListItem {
    fn from(cmd: SimpleCommand) -> Self {
        ListItem::foreground(cmd)
    }
}

impl From<Node> for ListItem {
    fn from(node: Node) -> Self {
        ListItem::foreground(node)
    }
}

impl Node {
    pub fn and(left: impl Into<Node>, right: impl Into<Node>) -> Self {
        Node::Logical(Logical {
            op: LogicalOp::And,
            left: Box::new(left.into()),
            right: Box::new(right.into()),
        })
    }

    pub fn or(left: impl Into<Node>, right: impl Into<Node>) -> Self {
        Node::Logical(Logical {
            op: LogicalOp::Or,
            left: Box::new(left.into()),
            right: Box::new(right.into()),
        })
    }

    pub fn pipeline(commands: Vec<SimpleCommand>) -> Self {
        Node::Pipeline(Pipeline {
            commands,
            negated: false,
        })
    }

    pub fn for_each(variable: &str, words: Vec<Word>, body: Vec<ListItem>) -> Self {
        Node::For(ForLoop {
            variable: variable.to_string(),
            words,
            body,
        })
    }

    pub fn if_else(
        condition: Vec<ListItem>,
        then_branch: Option<Vec<ListItem>>,
        else_branch: Option<Vec<ListItem>>,
    ) -> Self {
        Node::If(IfClause {
            condition,
            then_branch,
            else_branch,
        })
    }

    pub fn subshell(body: Vec<ListItem>) -> Self {
        Node::Subshell(body)
    }
}

impl SimpleCommand {
    pub fn new(name: impl Into<Word>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// A command made only of `NAME=value` words
    pub fn assignment(words: Vec<Word>) -> Self {
        Self {
            assignments: words,
            ..Self::default()
        }
    }

    pub fn arg(mut self, word: impl Into<Word>) -> Self {
        self.args.push(word.into());
        self
    }

    pub fn args<I, W>(mut self, words: I) -> Self
    where
        I: IntoIterator<Item = W>,
        W: Into<Word>,
    {
        self.args.extend(words.into_iter().map(Into::into));
        self
    }

    pub fn assign(mut self, word: impl Into<Word>) -> Self {
        self.assignments.push(word.into());
        self
    }

    pub fn redirect(mut self, op: RedirectOp, fd: Option<i32>, target: impl Into<Word>) -> Self {
        self.redirects.push(Redirect {
            op,
            fd,
            target: target.into(),
        });
        self
    }
}

impl Word {
    pub fn literal(text: impl Into<String>) -> Self {
        Self {
            parts: vec![WordPart::Literal(text.into())],
        }
    }

    pub fn param(name: impl Into<String>) -> Self {
        Self {
            parts: vec![WordPart::Param(name.into())],
        }
    }

    pub fn subst(items: Vec<ListItem>) -> Self {
        Self {
            parts: vec![WordPart::CommandSubst(items)],
        }
    }

    pub fn glob(pattern: impl Into<String>) -> Self {
        Self {
            parts: vec![WordPart::Glob(pattern.into())],
        }
    }

    pub fn push(mut self, part: WordPart) -> Self {
        self.parts.push(part);
        self
    }

    pub fn has_glob(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, WordPart::Glob(_)))
    }

    /// Word text when it needs no evaluation
    pub fn as_literal(&self) -> Option<String> {
        let mut text = String::new();
        for part in &self.parts {
            match part {
                WordPart::Literal(s) => text.push_str(s),
                _ => return None,
            }
        }
        Some(text)
    }
}

impl From<&str> for Word {
    fn from(text: &str) -> Self {
        Word::literal(text)
    }
}

impl From<String> for Word {
    fn from(text: String) -> Self {
        Word::literal(text)
    }
}
