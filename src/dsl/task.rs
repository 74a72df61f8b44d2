use indexmap::IndexMap;
use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::duration::DurationSpec;

/// Properties shared by every task kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskCommon {
    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    pub if_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<InputDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<ExportDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub then: Option<FlowDirective>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<SchemaDefinition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputDefinition {
    #[serde(default, rename = "as", skip_serializing_if = "Option::is_none")]
    pub as_: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<SchemaDefinition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportDefinition {
    #[serde(default, rename = "as", skip_serializing_if = "Option::is_none")]
    pub as_: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<SchemaDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    pub document: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutDefinition {
    pub after: DurationSpec,
}

/// Where control flow goes after a task completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowDirective {
    Continue,
    Exit,
    End,
    /// Jump to the named sibling task.
    Task(String),
}

impl Serialize for FlowDirective {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let text = match self {
            FlowDirective::Continue => "continue",
            FlowDirective::Exit => "exit",
            FlowDirective::End => "end",
            FlowDirective::Task(name) => name,
        };
        serializer.serialize_str(text)
    }
}

impl<'de> Deserialize<'de> for FlowDirective {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(match text.as_str() {
            "continue" => FlowDirective::Continue,
            "exit" => FlowDirective::Exit,
            "end" => FlowDirective::End,
            _ => FlowDirective::Task(text),
        })
    }
}

/// An ordered list of named tasks, as written in `do:` blocks.
///
/// In the document each entry is a single-key mapping (task name to task
/// body); order is significant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskList(pub Vec<TaskItem>);

#[derive(Debug, Clone, PartialEq)]
pub struct TaskItem {
    pub name: String,
    pub task: TaskDefinition,
}

impl TaskList {
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TaskItem> {
        self.0.iter()
    }
}

impl Serialize for TaskList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter().map(|item| {
            let mut map = IndexMap::with_capacity(1);
            map.insert(item.name.clone(), item.task.clone());
            map
        }))
    }
}

impl<'de> Deserialize<'de> for TaskList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries: Vec<IndexMap<String, TaskDefinition>> = Vec::deserialize(deserializer)?;
        let mut items = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.len() != 1 {
                return Err(de::Error::custom(
                    "each task list entry must be a single-key mapping",
                ));
            }
            for (name, task) in entry {
                items.push(TaskItem { name, task });
            }
        }
        Ok(TaskList(items))
    }
}

/// The typed union of task kinds.
///
/// Discrimination is by key presence (`call:`, `for:`, `try:`, ...); a mapping
/// carrying none of the known keys is a parse error, which surfaces as a
/// build-time failure when the definition is first referenced.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskDefinition {
    Call(CallTask),
    Do(DoTask),
    Emit(EmitTask),
    For(ForTask),
    Fork(ForkTask),
    Listen(ListenTask),
    Raise(RaiseTask),
    Run(RunTask),
    Set(SetTask),
    Switch(SwitchTask),
    Try(TryTask),
    Wait(WaitTask),
}

impl TaskDefinition {
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            TaskDefinition::Call(_) => "call",
            TaskDefinition::Do(_) => "do",
            TaskDefinition::Emit(_) => "emit",
            TaskDefinition::For(_) => "for",
            TaskDefinition::Fork(_) => "fork",
            TaskDefinition::Listen(_) => "listen",
            TaskDefinition::Raise(_) => "raise",
            TaskDefinition::Run(_) => "run",
            TaskDefinition::Set(_) => "set",
            TaskDefinition::Switch(_) => "switch",
            TaskDefinition::Try(_) => "try",
            TaskDefinition::Wait(_) => "wait",
        }
    }

    #[must_use]
    pub fn common(&self) -> &TaskCommon {
        match self {
            TaskDefinition::Call(t) => &t.common,
            TaskDefinition::Do(t) => &t.common,
            TaskDefinition::Emit(t) => &t.common,
            TaskDefinition::For(t) => &t.common,
            TaskDefinition::Fork(t) => &t.common,
            TaskDefinition::Listen(t) => &t.common,
            TaskDefinition::Raise(t) => &t.common,
            TaskDefinition::Run(t) => &t.common,
            TaskDefinition::Set(t) => &t.common,
            TaskDefinition::Switch(t) => &t.common,
            TaskDefinition::Try(t) => &t.common,
            TaskDefinition::Wait(t) => &t.common,
        }
    }
}

impl Serialize for TaskDefinition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            TaskDefinition::Call(t) => t.serialize(serializer),
            TaskDefinition::Do(t) => t.serialize(serializer),
            TaskDefinition::Emit(t) => t.serialize(serializer),
            TaskDefinition::For(t) => t.serialize(serializer),
            TaskDefinition::Fork(t) => t.serialize(serializer),
            TaskDefinition::Listen(t) => t.serialize(serializer),
            TaskDefinition::Raise(t) => t.serialize(serializer),
            TaskDefinition::Run(t) => t.serialize(serializer),
            TaskDefinition::Set(t) => t.serialize(serializer),
            TaskDefinition::Switch(t) => t.serialize(serializer),
            TaskDefinition::Try(t) => t.serialize(serializer),
            TaskDefinition::Wait(t) => t.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for TaskDefinition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let Some(map) = value.as_object() else {
            return Err(de::Error::custom("task must be a mapping"));
        };

        // `do` is checked last since composite kinds (for, try) carry one too.
        let kind = [
            "call", "emit", "for", "fork", "listen", "raise", "run", "set", "switch", "try",
            "wait", "do",
        ]
        .into_iter()
        .find(|key| map.contains_key(*key));

        fn convert<T, E>(value: Value) -> Result<T, E>
        where
            T: de::DeserializeOwned,
            E: de::Error,
        {
            serde_json::from_value(value).map_err(de::Error::custom)
        }

        match kind {
            Some("call") => convert(value).map(TaskDefinition::Call),
            Some("emit") => convert(value).map(TaskDefinition::Emit),
            Some("for") => convert(value).map(TaskDefinition::For),
            Some("fork") => convert(value).map(TaskDefinition::Fork),
            Some("listen") => convert(value).map(TaskDefinition::Listen),
            Some("raise") => convert(value).map(TaskDefinition::Raise),
            Some("run") => convert(value).map(TaskDefinition::Run),
            Some("set") => convert(value).map(TaskDefinition::Set),
            Some("switch") => convert(value).map(TaskDefinition::Switch),
            Some("try") => convert(value).map(TaskDefinition::Try),
            Some("wait") => convert(value).map(TaskDefinition::Wait),
            Some("do") => convert(value).map(TaskDefinition::Do),
            _ => Err(de::Error::custom(format!(
                "unknown task kind: no discriminating key in {:?}",
                map.keys().collect::<Vec<_>>()
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Task kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallTask {
    /// The call kind (`http` is the only built-in).
    pub call: String,
    /// Kind-specific arguments, parsed when the tree is built.
    pub with: Value,
    #[serde(flatten)]
    pub common: TaskCommon,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoTask {
    #[serde(rename = "do")]
    pub do_: TaskList,
    #[serde(flatten)]
    pub common: TaskCommon,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitTask {
    pub emit: Value,
    #[serde(flatten)]
    pub common: TaskCommon,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForTask {
    #[serde(rename = "for")]
    pub for_: ForClause,
    #[serde(default, rename = "while", skip_serializing_if = "Option::is_none")]
    pub while_: Option<String>,
    #[serde(rename = "do")]
    pub do_: TaskList,
    #[serde(flatten)]
    pub common: TaskCommon,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForClause {
    /// Name of the per-iteration item variable.
    #[serde(default = "ForClause::default_each")]
    pub each: String,
    /// Expression producing the collection to iterate.
    #[serde(rename = "in")]
    pub in_: String,
    /// Name of the per-iteration index variable.
    #[serde(default = "ForClause::default_at")]
    pub at: String,
}

impl ForClause {
    fn default_each() -> String {
        "item".to_string()
    }

    fn default_at() -> String {
        "index".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkTask {
    pub fork: ForkClause,
    #[serde(flatten)]
    pub common: TaskCommon,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkClause {
    pub branches: TaskList,
    #[serde(default)]
    pub compete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenTask {
    pub listen: Value,
    #[serde(flatten)]
    pub common: TaskCommon,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaiseTask {
    pub raise: RaiseClause,
    #[serde(flatten)]
    pub common: TaskCommon,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaiseClause {
    pub error: RaiseErrorSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RaiseErrorSpec {
    Definition(ErrorDefinition),
    /// Reference to a reusable error definition by name.
    Reference(String),
}

/// Literal or expression-valued error fields for `raise`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDefinition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: Value,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTask {
    pub run: RunClause,
    #[serde(flatten)]
    pub common: TaskCommon,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunClause {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<ShellProcess>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<ScriptProcess>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<SubflowReference>,
    #[serde(default = "default_true", rename = "await")]
    pub await_: bool,
    #[serde(default, rename = "return")]
    pub return_: ProcessReturnMode,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellProcess {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<IndexMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptProcess {
    pub language: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<IndexMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubflowReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

/// Which part of a finished process becomes the task's raw output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessReturnMode {
    #[default]
    Stdout,
    Stderr,
    Code,
    All,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetTask {
    pub set: IndexMap<String, Value>,
    #[serde(flatten)]
    pub common: TaskCommon,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwitchTask {
    pub switch: Vec<SwitchItem>,
    #[serde(flatten)]
    pub common: TaskCommon,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchItem {
    pub name: String,
    pub case: SwitchCase,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwitchCase {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub then: Option<FlowDirective>,
}

impl Serialize for SwitchItem {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.name, &self.case)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for SwitchTask {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            switch: Vec<IndexMap<String, SwitchCase>>,
            #[serde(flatten)]
            common: TaskCommon,
        }

        let raw = Raw::deserialize(deserializer)?;
        let mut switch = Vec::with_capacity(raw.switch.len());
        for entry in raw.switch {
            if entry.len() != 1 {
                return Err(de::Error::custom(
                    "each switch case must be a single-key mapping",
                ));
            }
            for (name, case) in entry {
                switch.push(SwitchItem { name, case });
            }
        }
        Ok(SwitchTask {
            switch,
            common: raw.common,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TryTask {
    #[serde(rename = "try")]
    pub try_: TaskList,
    pub catch: CatchClause,
    #[serde(flatten)]
    pub common: TaskCommon,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatchClause {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<ErrorFilter>,
    /// Variable name the caught error is exposed under (defaults to `error`).
    #[serde(default, rename = "as", skip_serializing_if = "Option::is_none")]
    pub as_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default, rename = "exceptWhen", skip_serializing_if = "Option::is_none")]
    pub except_when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryRef>,
    #[serde(default, rename = "do", skip_serializing_if = "Option::is_none")]
    pub do_: Option<TaskList>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with: Option<IndexMap<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RetryRef {
    Policy(RetryPolicyDefinition),
    /// Reference to a reusable policy declared under `use.retries`.
    Named(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicyDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<RetryLimit>,
    pub delay: DurationSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryLimit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<AttemptLimit>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttemptLimit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitTask {
    pub wait: DurationSpec,
    #[serde(flatten)]
    pub common: TaskCommon,
}

// ---------------------------------------------------------------------------
// HTTP call arguments (parsed from CallTask::with when the tree is built)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpArguments {
    pub method: String,
    pub endpoint: Endpoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<IndexMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<IndexMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default)]
    pub output: HttpOutputMode,
    /// When set, 3xx responses are followed instead of treated as errors.
    #[serde(default)]
    pub redirect: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Endpoint {
    /// A literal URI, a `{placeholder}` URI template, or a runtime expression.
    Uri(String),
    Configured(EndpointConfiguration),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfiguration {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<AuthenticationPolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthenticationPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic: Option<BasicAuthentication>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer: Option<BearerAuthentication>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicAuthentication {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BearerAuthentication {
    pub token: String,
}

/// What an HTTP call yields as raw output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpOutputMode {
    /// The decoded response body.
    #[default]
    Content,
    /// Status, headers and decoded body as one object.
    Response,
    /// The body, base64-encoded.
    Raw,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_kind_discrimination_by_key() {
        let set: TaskDefinition =
            serde_json::from_value(serde_json::json!({"set": {"a": 1}})).unwrap();
        assert_eq!(set.kind_name(), "set");

        let for_task: TaskDefinition = serde_json::from_value(serde_json::json!({
            "for": {"each": "x", "in": "${ .items }"},
            "do": [{"noop": {"set": {"seen": true}}}]
        }))
        .unwrap();
        assert_eq!(for_task.kind_name(), "for", "for must win over its do body");
    }

    #[test]
    fn unknown_task_kind_is_an_error() {
        let result: Result<TaskDefinition, _> =
            serde_json::from_value(serde_json::json!({"frobnicate": {}}));
        assert!(result.is_err());
    }

    #[test]
    fn task_list_preserves_order() {
        let yaml = r#"
- first:
    set:
      a: 1
- second:
    set:
      b: 2
"#;
        let list: TaskList = serde_yaml::from_str(yaml).unwrap();
        let names: Vec<_> = list.iter().map(|item| item.name.as_str()).collect();
        assert_eq!(names, ["first", "second"]);
    }

    #[test]
    fn flow_directive_keywords_and_names() {
        let parse = |s: &str| serde_json::from_value::<FlowDirective>(serde_json::json!(s)).unwrap();
        assert_eq!(parse("continue"), FlowDirective::Continue);
        assert_eq!(parse("exit"), FlowDirective::Exit);
        assert_eq!(parse("end"), FlowDirective::End);
        assert_eq!(parse("cleanup"), FlowDirective::Task("cleanup".to_string()));
    }

    #[test]
    fn switch_cases_keep_declaration_order() {
        let yaml = r#"
switch:
  - big:
      when: "${ .n > 10 }"
      then: handleBig
  - small:
      then: handleSmall
"#;
        let task: SwitchTask = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(task.switch.len(), 2);
        assert_eq!(task.switch[0].name, "big");
        assert!(task.switch[1].case.when.is_none());
    }

    #[test]
    fn retry_ref_accepts_name_or_policy() {
        let named: RetryRef = serde_json::from_value(serde_json::json!("default")).unwrap();
        assert_eq!(named, RetryRef::Named("default".to_string()));

        let inline: RetryRef = serde_json::from_value(serde_json::json!({
            "delay": "PT1S",
            "limit": {"attempt": {"count": 2}}
        }))
        .unwrap();
        match inline {
            RetryRef::Policy(policy) => {
                assert_eq!(
                    policy.limit.and_then(|l| l.attempt).and_then(|a| a.count),
                    Some(2)
                );
            }
            RetryRef::Named(_) => panic!("expected inline policy"),
        }
    }

    #[test]
    fn run_await_defaults_to_true() {
        let task: RunTask = serde_json::from_value(serde_json::json!({
            "run": {"shell": {"command": "echo hi"}}
        }))
        .unwrap();
        assert!(task.run.await_);
        assert_eq!(task.run.return_, ProcessReturnMode::Stdout);
    }
}
