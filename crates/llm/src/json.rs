use serde::de::DeserializeOwned;

/// Pull a JSON document out of free-form model output.
///
/// Fenced code blocks are tried first, in order.  Failing that, each `{` in
/// the text is tried as the start of an object; the streaming deserializer
/// stops at the matching `}` so prose after the object is ignored.
pub fn extract_json_output<T: DeserializeOwned>(response: &str) -> Option<T> {
    fenced_bodies(response)
        .find_map(|body| serde_json::from_str(body.trim()).ok())
        .or_else(|| first_object(response))
}

/// Contents of every ```-fenced block, minus a leading `json` tag.  An
/// unterminated final fence runs to the end of the text.
fn fenced_bodies(text: &str) -> impl Iterator<Item = &str> {
    text.split("```").skip(1).step_by(2).map(|block| {
        let block = block.trim_start();
        match block.get(..4) {
            Some(tag) if tag.eq_ignore_ascii_case("json") => &block[4..],
            _ => block,
        }
    })
}

fn first_object<T: DeserializeOwned>(text: &str) -> Option<T> {
    text.match_indices('{').find_map(|(start, _)| {
        serde_json::Deserializer::from_str(&text[start..])
            .into_iter::<T>()
            .next()?
            .ok()
    })
}
