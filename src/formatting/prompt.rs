use crate::models::ModelFamily;

/// Chat-turn framing of one model family: `open`, the optional image
/// placeholder, `lead`, the user text, then `close`.
struct Template {
    open: &'static str,
    placeholder: &'static str,
    lead: &'static str,
    close: &'static str,
}

/// Bare placeholder plus text, for families without a dedicated template.
const FALLBACK: Template = Template {
    open: "",
    placeholder: "<image>\n",
    lead: "",
    close: "",
};

const GEMMA3: Template = Template {
    open: "<start_of_turn>user\n",
    placeholder: "<image>\n",
    lead: "",
    close: "\n<end_of_turn>\n<start_of_turn>model",
};

const HERON_NVILA: Template = Template {
    open: "",
    placeholder: "[IMG]\n",
    lead: "USER: ",
    close: "\nASSISTANT:",
};

fn template(family: ModelFamily) -> &'static Template {
    match family {
        ModelFamily::Gemma3 => &GEMMA3,
        ModelFamily::HeronNvila => &HERON_NVILA,
        ModelFamily::Llava => &FALLBACK,
    }
}

/// Frames `user_text` in the family's chat template. The text is inserted
/// verbatim; this never fails.
pub fn format_prompt(family: ModelFamily, user_text: &str, include_image: bool) -> String {
    let t = template(family);
    let placeholder = if include_image { t.placeholder } else { "" };
    [t.open, placeholder, t.lead, user_text, t.close].concat()
}
