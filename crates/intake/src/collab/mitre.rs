use std::collections::BTreeMap;

use super::{BoxFuture, CollabError, Indicator, IndicatorKind, MitreMapper, TechniqueMatch};

struct Technique {
    id: &'static str,
    name: &'static str,
    tactic: &'static str,
}

const WEB_PROTOCOLS: Technique = Technique { id: "T1071.001", name: "Web Protocols", tactic: "command-and-control" };
const DNS: Technique = Technique { id: "T1071.004", name: "DNS", tactic: "command-and-control" };
const APP_LAYER: Technique = Technique { id: "T1071", name: "Application Layer Protocol", tactic: "command-and-control" };
const PHISHING: Technique = Technique { id: "T1566", name: "Phishing", tactic: "initial-access" };
const MALICIOUS_FILE: Technique = Technique { id: "T1204.002", name: "Malicious File", tactic: "execution" };

/// Keywords looked up in indicator context lines
const KEYWORDS: &[(&str, Technique)] = &[
    ("powershell", Technique { id: "T1059.001", name: "PowerShell", tactic: "execution" }),
    ("cmd.exe", Technique { id: "T1059.003", name: "Windows Command Shell", tactic: "execution" }),
    ("mimikatz", Technique { id: "T1003.001", name: "LSASS Memory", tactic: "credential-access" }),
    ("lsass", Technique { id: "T1003.001", name: "LSASS Memory", tactic: "credential-access" }),
    ("schtasks", Technique { id: "T1053.005", name: "Scheduled Task", tactic: "persistence" }),
    ("psexec", Technique { id: "T1569.002", name: "Service Execution", tactic: "execution" }),
    ("certutil", Technique { id: "T1105", name: "Ingress Tool Transfer", tactic: "command-and-control" }),
    ("failed password", Technique { id: "T1110", name: "Brute Force", tactic: "credential-access" }),
];

const KEYWORD_WEIGHT: f32 = 0.9;

fn technique_for(kind: IndicatorKind) -> (&'static Technique, f32) {
    match kind {
        IndicatorKind::Url => (&WEB_PROTOCOLS, 0.6),
        IndicatorKind::Domain => (&DNS, 0.4),
        IndicatorKind::Ipv4 => (&APP_LAYER, 0.3),
        IndicatorKind::Email => (&PHISHING, 0.4),
        IndicatorKind::Md5 | IndicatorKind::Sha1 | IndicatorKind::Sha256 => (&MALICIOUS_FILE, 0.5),
    }
}

/// Maps indicator kinds and context keywords to ATT&CK techniques.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordMitreMapper;

impl KeywordMitreMapper {
    pub fn new() -> Self {
        Self
    }

    pub fn map_sync(&self, indicators: &[Indicator]) -> Vec<TechniqueMatch> {
        let mut matches: BTreeMap<&'static str, TechniqueMatch> = BTreeMap::new();

        let mut hit = |technique: &Technique, confidence: f32, evidence: &str| {
            let entry = matches.entry(technique.id).or_insert_with(|| TechniqueMatch {
                technique_id: technique.id.to_string(),
                name: technique.name.to_string(),
                tactic: technique.tactic.to_string(),
                confidence: 0.0,
                evidence: Vec::new(),
            });
            entry.confidence = entry.confidence.max(confidence);
            if !entry.evidence.iter().any(|e| e == evidence) {
                entry.evidence.push(evidence.to_string());
            }
        };

        for indicator in indicators {
            let (technique, weight) = technique_for(indicator.kind);
            hit(technique, indicator.confidence * weight, &indicator.value);

            let Some(context) = indicator.context.as_deref() else { continue };
            let context = context.to_ascii_lowercase();
            for (keyword, technique) in KEYWORDS {
                if context.contains(*keyword) {
                    hit(technique, indicator.confidence * KEYWORD_WEIGHT, &indicator.value);
                }
            }
        }

        let mut out: Vec<TechniqueMatch> = matches.into_values().collect();
        out.sort_by(|a, b| b.confidence.total_cmp(&a.confidence).then_with(|| a.technique_id.cmp(&b.technique_id)));
        out
    }
}

impl MitreMapper for KeywordMitreMapper {
    fn map<'a>(&'a self, indicators: &'a [Indicator]) -> BoxFuture<'a, Result<Vec<TechniqueMatch>, CollabError>> {
        Box::pin(async move { Ok(self.map_sync(indicators)) })
    }
}
