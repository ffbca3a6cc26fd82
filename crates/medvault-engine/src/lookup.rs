//! 结构化检索引擎
//!
//! 约束按三类执行：已索引的标识符走索引探测；已索引的主标签在
//! 候选集上本地复核；未索引的标签读取代表实例的JSON附件逐条比对。
//! 标识符探测可能比谓词宽松（通配转LIKE），所以探测结果总会再次
//! 用谓词复核。患者层的约束会透明克隆到检查层，使限定到检查及
//! 以下层级的查询仍能按患者身份过滤。

use medvault_core::{ArchiveError, ContentType, ResourceLevel, Result};
use medvault_dicom::map::DicomMap;
use medvault_dicom::tags::{self, DicomTag};
use medvault_index::IndexStore;
use medvault_storage::StorageAccessor;
use regex::RegexBuilder;
use std::collections::BTreeSet;
use tracing::debug;

/// 匹配谓词
#[derive(Debug, Clone)]
pub enum Predicate {
    /// 字面相等
    Equals(String),
    /// DICOM通配：`*` 任意串（含空串），`?` 恰好一个字符
    Wildcard(String),
}

impl Predicate {
    /// 谓词是否命中一个标签值。通配匹配不区分大小写且两端锚定。
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Predicate::Equals(expected) => value == expected,
            Predicate::Wildcard(pattern) => {
                let regex = format!("^(?:{})$", wildcard_to_regex(pattern));
                RegexBuilder::new(&regex)
                    .case_insensitive(true)
                    .build()
                    .map(|re| re.is_match(value))
                    .unwrap_or(false)
            }
        }
    }
}

/// 通配模式转正则片段：`*` → `.*`，`?` → `.`，其余元字符转义
pub fn wildcard_to_regex(wildcard: &str) -> String {
    let mut regex = String::with_capacity(wildcard.len() * 2);
    for c in wildcard.chars() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\' => {
                regex.push('\\');
                regex.push(c);
            }
            _ => regex.push(c),
        }
    }
    regex
}

/// 通配模式转SQL LIKE：`*` → `%`，`?` → `_`，`%`/`_`/`!` 用 `!` 转义
fn wildcard_to_like(wildcard: &str) -> String {
    let mut like = String::with_capacity(wildcard.len() * 2);
    for c in wildcard.chars() {
        match c {
            '*' => like.push('%'),
            '?' => like.push('_'),
            '%' | '_' | '!' => {
                like.push('!');
                like.push(c);
            }
            _ => like.push(c),
        }
    }
    like
}

/// 一条标签约束
#[derive(Debug, Clone)]
pub struct Constraint {
    pub tag: DicomTag,
    pub predicate: Predicate,
}

impl Constraint {
    pub fn equals(tag: DicomTag, value: impl Into<String>) -> Self {
        Constraint {
            tag,
            predicate: Predicate::Equals(value.into()),
        }
    }

    pub fn wildcard(tag: DicomTag, pattern: impl Into<String>) -> Self {
        Constraint {
            tag,
            predicate: Predicate::Wildcard(pattern.into()),
        }
    }
}

/// 目标层级上的结构化查询
#[derive(Debug, Clone)]
pub struct Query {
    pub level: ResourceLevel,
    pub constraints: Vec<Constraint>,
    /// 结果上限，0 表示不限制
    pub max_results: usize,
}

/// 单个层级的执行计划
#[derive(Default)]
struct LevelPlan<'a> {
    /// 本层的标识符约束（走索引探测）
    identifiers: Vec<&'a Constraint>,
    /// 本层的其他主标签约束（本地复核）
    main_tags: Vec<&'a Constraint>,
    /// 从患者层克隆下来的标识符约束（按检查层的患者身份行探测）
    parent_identifiers: Vec<&'a Constraint>,
    /// 从患者层克隆下来的主标签约束（对父资源的主标签复核）
    parent_main_tags: Vec<&'a Constraint>,
}

impl LevelPlan<'_> {
    fn is_empty(&self) -> bool {
        self.identifiers.is_empty()
            && self.main_tags.is_empty()
            && self.parent_identifiers.is_empty()
            && self.parent_main_tags.is_empty()
    }

    fn has_probes(&self) -> bool {
        !self.identifiers.is_empty() || !self.parent_identifiers.is_empty()
    }
}

/// 检索引擎，借用索引与存储执行一次查询
pub struct LookupEngine<'a> {
    index: &'a IndexStore,
    storage: &'a StorageAccessor,
}

impl<'a> LookupEngine<'a> {
    pub fn new(index: &'a IndexStore, storage: &'a StorageAccessor) -> Self {
        LookupEngine { index, storage }
    }

    /// 执行查询，返回目标层级的公开ID列表
    pub async fn find(&self, query: &Query) -> Result<Vec<String>> {
        let applied_levels = applied_levels(query.level);

        // 约束分类
        let mut plans: Vec<LevelPlan> = applied_levels.iter().map(|_| LevelPlan::default()).collect();
        let mut unindexed: Vec<&Constraint> = Vec::new();
        for constraint in &query.constraints {
            classify(constraint, query.level, &applied_levels, &mut plans, &mut unindexed);
        }

        // 沿层级下行，交替执行探测与本地复核
        let mut candidates: Option<Vec<i64>> = None;
        for (position, level) in applied_levels.iter().enumerate() {
            let plan = &plans[position];

            let mut current = match &candidates {
                None => {
                    if plan.has_probes() {
                        self.probe(*level, plan).await?
                    } else {
                        self.index.all_at_level(*level).await?
                    }
                }
                Some(previous) => {
                    let mut children = Vec::new();
                    for parent in previous {
                        children.extend(self.index.get_children(*parent).await?);
                    }
                    if plan.has_probes() {
                        let probed: BTreeSet<i64> =
                            self.probe(*level, plan).await?.into_iter().collect();
                        children.retain(|id| probed.contains(id));
                    }
                    children
                }
            };

            if !plan.is_empty() {
                current = self.refine(current, plan).await?;
            }
            candidates = Some(current);
        }

        let mut matched = candidates.unwrap_or_default();

        // 未索引的约束：读取代表实例的JSON附件
        if !unindexed.is_empty() {
            matched = self.apply_unindexed(matched, &unindexed, query.max_results).await?;
        }

        if query.max_results > 0 && matched.len() > query.max_results {
            matched.truncate(query.max_results);
        }

        let mut result = Vec::with_capacity(matched.len());
        for id in matched {
            result.push(self.index.get_public_id(id).await?);
        }
        debug!("lookup at level {} matched {} resources", query.level, result.len());
        Ok(result)
    }

    /// 标识符探测：所有约束的命中集取交集
    async fn probe(&self, level: ResourceLevel, plan: &LevelPlan<'_>) -> Result<Vec<i64>> {
        let mut intersection: Option<BTreeSet<i64>> = None;
        for constraint in plan.identifiers.iter().chain(plan.parent_identifiers.iter()) {
            let hits: BTreeSet<i64> = match &constraint.predicate {
                Predicate::Equals(value) => {
                    self.index
                        .lookup_identifier(constraint.tag, value, level)
                        .await?
                }
                Predicate::Wildcard(pattern) => {
                    self.index
                        .lookup_identifier_wildcard(constraint.tag, &wildcard_to_like(pattern), level)
                        .await?
                }
            }
            .into_iter()
            .collect();

            intersection = Some(match intersection {
                None => hits,
                Some(acc) => acc.intersection(&hits).copied().collect(),
            });
        }
        Ok(intersection.unwrap_or_default().into_iter().collect())
    }

    /// 本地复核：读主标签重新套谓词（标识符也复核，探测比谓词宽松）
    async fn refine(&self, candidates: Vec<i64>, plan: &LevelPlan<'_>) -> Result<Vec<i64>> {
        let mut filtered = Vec::new();
        'candidates: for id in candidates {
            let own_tags = self.index.get_main_tags(id).await?;
            for constraint in plan.identifiers.iter().chain(plan.main_tags.iter()) {
                if !matches_map(&own_tags, constraint) {
                    continue 'candidates;
                }
            }

            if !plan.parent_identifiers.is_empty() || !plan.parent_main_tags.is_empty() {
                let Some(parent) = self.index.lookup_parent(id).await? else {
                    continue 'candidates;
                };
                let parent_tags = self.index.get_main_tags(parent).await?;
                for constraint in plan
                    .parent_identifiers
                    .iter()
                    .chain(plan.parent_main_tags.iter())
                {
                    if !matches_map(&parent_tags, constraint) {
                        continue 'candidates;
                    }
                }
            }

            filtered.push(id);
        }
        Ok(filtered)
    }

    /// 未索引约束：下行取第一个可达实例，检查其JSON附件的文本值
    async fn apply_unindexed(
        &self,
        candidates: Vec<i64>,
        constraints: &[&Constraint],
        max_results: usize,
    ) -> Result<Vec<i64>> {
        let mut filtered = Vec::new();
        for id in candidates {
            if max_results > 0 && filtered.len() >= max_results {
                break;
            }

            let Some(instance) = self.index.find_child_instance(id).await? else {
                continue;
            };
            let Some(attachment) = self
                .index
                .lookup_attachment(instance, ContentType::DicomAsJson)
                .await?
            else {
                continue;
            };
            let bytes = self.storage.read(&attachment, true).await?;
            let content: serde_json::Value = serde_json::from_slice(&bytes)
                .map_err(|e| ArchiveError::CorruptedFile(e.to_string()))?;

            let matches = constraints.iter().all(|constraint| {
                let node = &content[constraint.tag.to_string()];
                node["Type"] == "String"
                    && node["Value"]
                        .as_str()
                        .map(|value| constraint.predicate.matches(value))
                        .unwrap_or(false)
            });
            if matches {
                filtered.push(id);
            }
        }
        Ok(filtered)
    }
}

/// 查询在各层级的执行顺序；检查以下的层级从检查层开始下行
fn applied_levels(target: ResourceLevel) -> Vec<ResourceLevel> {
    match target {
        ResourceLevel::Patient => vec![ResourceLevel::Patient],
        ResourceLevel::Study => vec![ResourceLevel::Study],
        ResourceLevel::Series => vec![ResourceLevel::Study, ResourceLevel::Series],
        ResourceLevel::Instance => vec![
            ResourceLevel::Study,
            ResourceLevel::Series,
            ResourceLevel::Instance,
        ],
    }
}

fn classify<'a>(
    constraint: &'a Constraint,
    target: ResourceLevel,
    applied_levels: &[ResourceLevel],
    plans: &mut [LevelPlan<'a>],
    unindexed: &mut Vec<&'a Constraint>,
) {
    // 目标层级链上的主标签
    for (position, level) in applied_levels.iter().enumerate() {
        if tags::is_main_tag(constraint.tag, *level) {
            if tags::identifier_tags(*level).contains(&constraint.tag) {
                plans[position].identifiers.push(constraint);
            } else {
                plans[position].main_tags.push(constraint);
            }
            return;
        }
    }

    // 患者层约束克隆到检查层
    if target != ResourceLevel::Patient && tags::is_main_tag(constraint.tag, ResourceLevel::Patient)
    {
        if constraint.tag == tags::PATIENT_ID {
            plans[0].parent_identifiers.push(constraint);
        } else {
            plans[0].parent_main_tags.push(constraint);
        }
        return;
    }

    unindexed.push(constraint);
}

fn matches_map(map: &DicomMap, constraint: &Constraint) -> bool {
    match map.value_str(constraint.tag) {
        Some(value) => constraint.predicate.matches(value),
        None => false,
    }
}
