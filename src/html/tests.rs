#![cfg(test)]

use super::{plain_text, unescape};

macro_rules! test_p {
    ($name:ident, $input:expr, $output:expr) => {
        #[test]
        fn $name() {
            assert_eq!($output, plain_text($input));
        }
    };
}

macro_rules! test_u {
    ($name:ident, $input:expr, $output:expr) => {
        #[test]
        fn $name() {
            assert_eq!($output, unescape($input));
        }
    };
}

test_p!(br, "I<br>am<br>broken", "I\nam\nbroken");
test_p!(br_self_closing, "one<br/>two<BR />three", "one\ntwo\nthree");
test_p!(
    wbr,
    "an<wbr>ti<wbr>dis<wbr>es<wbr>tab<wbr>lish<wbr>ment<wbr>ar<wbr>i<wbr>an<wbr>ism",
    "antidisestablishmentarianism"
);
test_p!(
    quotelink,
    r##"<a href="#p123456" class="quotelink">&gt;&gt;123456</a> checked"##,
    ">>123456 checked"
);
test_p!(
    quote,
    r#"<span class="quote">&gt;implying</span>"#,
    ">implying"
);
test_p!(
    spoiler,
    "it is <s>great</s>",
    "it is great"
);
test_p!(
    banned,
    r#"nice try<br><b style="color: red;">(USER WAS BANNED FOR THIS POST)</b>"#,
    "nice try\n(USER WAS BANNED FOR THIS POST)"
);
test_p!(untagged, "no markup at all", "no markup at all");
test_p!(empty, "", "");

test_u!(escapes, "&lt;&#039;&amp;&quot;&gt;", r#"<'&">"#);
test_u!(
    complex_ampersand,
    "&amp;#039; &amp;gt; &amp;lt; &amp;quot; &amp;amp;",
    "&#039; &gt; &lt; &quot; &amp;"
);
