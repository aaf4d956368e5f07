//! Locale selection and the per-locale inspection prompts sent to the vision model.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Locales the service can produce assessments in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Locale {
    /// Traditional Chinese
    #[default]
    #[serde(rename = "zh-TW")]
    ZhTw,
    /// Simplified Chinese
    #[serde(rename = "zh-CN")]
    ZhCn,
    /// English
    #[serde(rename = "en")]
    En,
    /// German
    #[serde(rename = "de")]
    De,
}

impl Locale {
    /// All supported locales
    pub const ALL: [Locale; 4] = [Locale::ZhTw, Locale::ZhCn, Locale::En, Locale::De];

    /// Resolve a locale tag, falling back to the default locale for anything unknown.
    ///
    /// Matching is case-insensitive and accepts `_` as a separator. Bare `zh` and
    /// the Traditional script/regions resolve to `zh-TW`; the Simplified script
    /// and mainland/Singapore regions resolve to `zh-CN`.
    pub fn resolve(tag: Option<&str>) -> Self {
        tag.and_then(Self::parse).unwrap_or_default()
    }

    /// Resolve a locale tag with an explicit fallback
    pub fn resolve_or(tag: Option<&str>, fallback: Locale) -> Self {
        tag.and_then(Self::parse).unwrap_or(fallback)
    }

    fn parse(tag: &str) -> Option<Self> {
        let normalized = tag.trim().replace('_', "-").to_ascii_lowercase();
        let mut parts = normalized.split('-');
        let language = parts.next()?;
        let rest: Vec<&str> = parts.collect();

        match language {
            "zh" => {
                let simplified = rest
                    .iter()
                    .any(|p| matches!(*p, "cn" | "sg" | "hans"));
                Some(if simplified { Locale::ZhCn } else { Locale::ZhTw })
            }
            "en" => Some(Locale::En),
            "de" => Some(Locale::De),
            _ => None,
        }
    }

    /// Canonical tag
    pub fn tag(&self) -> &'static str {
        match self {
            Locale::ZhTw => "zh-TW",
            Locale::ZhCn => "zh-CN",
            Locale::En => "en",
            Locale::De => "de",
        }
    }

    /// Instruction prompt for this locale
    pub fn prompt(&self) -> &'static str {
        match self {
            Locale::ZhTw => PROMPT_ZH_TW,
            Locale::ZhCn => PROMPT_ZH_CN,
            Locale::En => PROMPT_EN,
            Locale::De => PROMPT_DE,
        }
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

const PROMPT_ZH_TW: &str = "\
你是一位專業的工地安全與品質檢查專家。請仔細分析這張工地照片，並檢查以下方面的問題：

1. 安全問題：
   - 工人是否正確使用個人防護裝備（如安全帽、安全帶、護目鏡等）
   - 是否有墜落危險
   - 電氣安全問題
   - 機械操作安全問題
   - 其他可能的安全隱患

2. 衛生問題：
   - 工地環境是否整潔
   - 廢棄物處理是否適當
   - 是否有污染或有害物質暴露問題

3. 施工品質問題：
   - 是否有明顯的施工瑕疵
   - 材料使用是否適當
   - 施工技術是否符合標準
   - 是否有施工錯誤

請提供詳細的分析，並針對發現的問題提出改善建議。如果照片中沒有明顯問題，也請說明。

回覆格式：
1. 照片概述：（簡要描述照片內容）
2. 安全問題分析：（列出發現的安全問題）
3. 衛生問題分析：（列出發現的衛生問題）
4. 施工品質分析：（列出發現的施工品質問題）
5. 建議改善措施：（針對發現的問題提出具體改善建議）

請使用繁體中文回答。
";

const PROMPT_ZH_CN: &str = "\
你是一位专业的工地安全与质量检查专家。请仔细分析这张工地照片，并检查以下方面的问题：

1. 安全问题：
   - 工人是否正确使用个人防护装备（如安全帽、安全带、护目镜等）
   - 是否有坠落危险
   - 电气安全问题
   - 机械操作安全问题
   - 其他可能的安全隐患

2. 卫生问题：
   - 工地环境是否整洁
   - 废弃物处理是否适当
   - 是否有污染或有害物质暴露问题

3. 施工质量问题：
   - 是否有明显的施工瑕疵
   - 材料使用是否适当
   - 施工技术是否符合标准
   - 是否有施工错误

请提供详细的分析，并针对发现的问题提出改善建议。如果照片中没有明显问题，也请说明。

回复格式：
1. 照片概述：（简要描述照片内容）
2. 安全问题分析：（列出发现的安全问题）
3. 卫生问题分析：（列出发现的卫生问题）
4. 施工质量分析：（列出发现的施工质量问题）
5. 建议改善措施：（针对发现的问题提出具体改善建议）

请使用简体中文回答。
";

const PROMPT_EN: &str = "\
You are a professional construction site safety and quality inspector. Carefully analyze this site photo and check for problems in the following areas:

1. Safety:
   - Are workers wearing personal protective equipment correctly (hard hats, harnesses, eye protection, etc.)?
   - Are there fall hazards?
   - Electrical safety issues
   - Machinery operation safety issues
   - Any other potential hazards

2. Hygiene:
   - Is the site clean and orderly?
   - Is waste handled appropriately?
   - Is there pollution or exposure to hazardous substances?

3. Workmanship quality:
   - Are there visible construction defects?
   - Are materials used appropriately?
   - Does the workmanship meet standards?
   - Are there construction errors?

Provide a detailed analysis and recommend improvements for every problem found. If the photo shows no obvious problems, say so.

Response format:
1. Photo overview: (brief description of the photo)
2. Safety analysis: (safety problems found)
3. Hygiene analysis: (hygiene problems found)
4. Workmanship analysis: (quality problems found)
5. Recommended improvements: (concrete measures for the problems found)

Answer in English.
";

const PROMPT_DE: &str = "\
Sie sind ein erfahrener Prüfer für Sicherheit und Qualität auf Baustellen. Analysieren Sie dieses Baustellenfoto sorgfältig und prüfen Sie die folgenden Bereiche:

1. Sicherheit:
   - Tragen die Arbeiter ihre persönliche Schutzausrüstung korrekt (Schutzhelm, Auffanggurt, Schutzbrille usw.)?
   - Bestehen Absturzgefahren?
   - Probleme der elektrischen Sicherheit
   - Probleme bei der Bedienung von Maschinen
   - Sonstige mögliche Gefahren

2. Hygiene:
   - Ist die Baustelle sauber und ordentlich?
   - Werden Abfälle ordnungsgemäß entsorgt?
   - Gibt es Verschmutzungen oder eine Belastung durch Gefahrstoffe?

3. Ausführungsqualität:
   - Gibt es sichtbare Baumängel?
   - Werden die Materialien angemessen eingesetzt?
   - Entspricht die Ausführung den Normen?
   - Gibt es Ausführungsfehler?

Erstellen Sie eine ausführliche Analyse und schlagen Sie für jedes festgestellte Problem Verbesserungen vor. Falls das Foto keine offensichtlichen Probleme zeigt, geben Sie dies ebenfalls an.

Antwortformat:
1. Fotoübersicht: (kurze Beschreibung des Fotos)
2. Sicherheitsanalyse: (festgestellte Sicherheitsprobleme)
3. Hygieneanalyse: (festgestellte Hygieneprobleme)
4. Qualitätsanalyse: (festgestellte Qualitätsprobleme)
5. Empfohlene Maßnahmen: (konkrete Verbesserungsvorschläge)

Bitte antworten Sie auf Deutsch.
";
